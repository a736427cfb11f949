//! Session Store
//!
//! In-memory registry of live tunnel sessions. Each session owns the handle to
//! its agent connection and a table of requests waiting for a correlated
//! response. Sessions live for a fixed lifetime from creation; on expiry the
//! store closes the connection and forgets the session.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_common::constants::MAX_ID_ATTEMPTS;
use tunnel_common::utils::{calculate_expiry, current_timestamp_secs};
use tunnel_common::{
    HttpResponse, Message, Result, SessionInfo, TunnelError, generate_request_id,
    generate_session_id,
};

/// Write side of a tunnel connection, shared by the store and the connection task
///
/// Outbound messages are queued to a single writer task, so concurrent ingress
/// requests never interleave bytes on the socket.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl TunnelHandle {
    /// Create a handle plus the receiving end the writer task drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound,
                closed: CancellationToken::new(),
            },
            outbound_rx,
        )
    }

    /// Queue a message for the agent
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed("tunnel connection closed".to_string()));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TunnelError::SessionClosed("tunnel writer has exited".to_string()))
    }

    /// Ask the connection tasks to shut the socket down. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// A request waiting for the agent's answer
#[derive(Debug)]
struct PendingRequest {
    sender: oneshot::Sender<HttpResponse>,
    created_at: Instant,
}

/// Outcome of handing an agent response to the pending table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The waiting ingress request received the response
    Delivered,
    /// No request with this ID is pending (late, duplicate or unknown)
    Unknown,
    /// The waiter gave up between lookup and delivery
    Abandoned,
}

/// Broker-side record binding one agent connection to one endpoint token
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub endpoint_token: String,
    /// Unix timestamps announced to the agent
    pub created_at: i64,
    pub expires_at: i64,
    deadline: Instant,
    connection: TunnelHandle,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Session {
    fn new(
        session_id: String,
        endpoint_token: String,
        connection: TunnelHandle,
        ttl: Duration,
    ) -> Self {
        Self {
            session_id,
            endpoint_token,
            created_at: current_timestamp_secs(),
            expires_at: calculate_expiry(ttl.as_secs()),
            deadline: Instant::now() + ttl,
            connection,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection(&self) -> &TunnelHandle {
        &self.connection
    }

    /// Whether the session has outlived its lifetime
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Session announcement for the agent, with the public URL under `public_base_url`
    pub fn info(&self, public_base_url: &str) -> SessionInfo {
        SessionInfo::new(
            self.session_id.clone(),
            self.endpoint_token.clone(),
            format!(
                "{}/{}",
                public_base_url.trim_end_matches('/'),
                self.endpoint_token
            ),
            self.created_at,
            self.expires_at,
        )
    }

    /// Allocate a request ID that is not pending in this session and start waiting for it
    pub fn register_request(&self) -> Result<(String, oneshot::Receiver<HttpResponse>)> {
        let mut pending = self.lock_pending();

        for _ in 0..MAX_ID_ATTEMPTS {
            let request_id = generate_request_id();
            if pending.contains_key(&request_id) {
                continue;
            }

            let (sender, receiver) = oneshot::channel();
            pending.insert(
                request_id.clone(),
                PendingRequest {
                    sender,
                    created_at: Instant::now(),
                },
            );
            return Ok((request_id, receiver));
        }

        Err(TunnelError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Hand an agent response to the request waiting on `request_id`
    ///
    /// The entry is removed either way, so a completed response is never retained.
    pub fn complete_request(&self, request_id: &str, response: HttpResponse) -> Delivery {
        let Some(waiter) = self.lock_pending().remove(request_id) else {
            return Delivery::Unknown;
        };

        debug!(
            session_id = %self.session_id,
            request_id,
            waited_ms = waiter.created_at.elapsed().as_millis() as u64,
            "Delivering agent response"
        );

        match waiter.sender.send(response) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Abandoned,
        }
    }

    /// Stop waiting for `request_id`. Returns false if it was not pending.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        self.lock_pending().remove(request_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Close the connection and release every waiter; they observe a closed channel
    fn close(&self) {
        self.connection.close();
        let abandoned = std::mem::take(&mut *self.lock_pending());
        if !abandoned.is_empty() {
            debug!(
                session_id = %self.session_id,
                count = abandoned.len(),
                "Releasing pending requests of closed session"
            );
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a pending request when the waiting side goes away on any path
pub struct PendingGuard {
    session: Arc<Session>,
    request_id: String,
}

impl PendingGuard {
    pub fn new(session: Arc<Session>, request_id: String) -> Self {
        Self {
            session,
            request_id,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.session.cancel_request(&self.request_id) {
            debug!(
                session_id = %self.session.session_id,
                request_id = %self.request_id,
                "Evicted unanswered pending request"
            );
        }
    }
}

/// Registry of live sessions plus the public endpoint index
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    endpoints: DashMap<String, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session bound to `endpoint_token` and arm its expiry timer
    ///
    /// Session ID collisions are retried internally. A taken endpoint token is
    /// reported as `TokenCollision` so the caller can retry with a fresh one.
    pub fn create(
        self: &Arc<Self>,
        endpoint_token: String,
        connection: TunnelHandle,
        ttl: Duration,
    ) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let session_id = generate_session_id();

            let Entry::Vacant(slot) = self.sessions.entry(session_id.clone()) else {
                continue;
            };

            match self.endpoints.entry(endpoint_token.clone()) {
                Entry::Occupied(_) => return Err(TunnelError::TokenCollision(endpoint_token)),
                Entry::Vacant(index) => {
                    index.insert(session_id.clone());
                }
            }

            let session = Arc::new(Session::new(
                session_id.clone(),
                endpoint_token,
                connection.clone(),
                ttl,
            ));
            slot.insert(session);

            self.spawn_expiry(session_id.clone(), connection, ttl);
            return Ok(session_id);
        }

        Err(TunnelError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Resolve a public endpoint token to its live session ID
    pub fn lookup_by_endpoint(&self, endpoint_token: &str) -> Option<String> {
        let session_id = self.endpoints.get(endpoint_token)?.value().clone();
        match self.sessions.get(&session_id) {
            Some(session) if !session.is_expired() => Some(session_id),
            _ => None,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Remove a session, close its connection and release its waiters
    ///
    /// Idempotent: returns false when the session is already gone.
    pub fn remove(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };

        self.endpoints
            .remove_if(&session.endpoint_token, |_, owner| owner == session_id);
        session.close();
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Expire the session after `ttl` unless its connection closes first
    fn spawn_expiry(self: &Arc<Self>, session_id: String, connection: TunnelHandle, ttl: Duration) {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {
                    let Some(store) = store.upgrade() else {
                        return;
                    };
                    if store.remove(&session_id) {
                        info!(
                            %session_id,
                            ttl_secs = ttl.as_secs(),
                            "[TUNNEL] EXPIRED: session lifetime reached"
                        );
                    } else {
                        warn!(%session_id, "Expiry fired for a session that was already removed");
                    }
                }
                _ = connection.closed() => {
                    debug!(%session_id, "Expiry timer cancelled: connection closed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_common::constants::OUTBOUND_QUEUE_CAPACITY;
    use tunnel_common::generate_endpoint_token;

    const TTL: Duration = Duration::from_secs(60);

    fn new_session(store: &Arc<SessionStore>) -> (String, String, mpsc::Receiver<Message>) {
        let (handle, rx) = TunnelHandle::new(OUTBOUND_QUEUE_CAPACITY);
        let token = generate_endpoint_token();
        let session_id = store.create(token.clone(), handle, TTL).unwrap();
        (session_id, token, rx)
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = Arc::new(SessionStore::new());
        let (session_id, token, _rx) = new_session(&store);

        assert_ne!(session_id, token);
        assert_eq!(store.lookup_by_endpoint(&token), Some(session_id.clone()));

        let session = store.get(&session_id).unwrap();
        assert_eq!(session.endpoint_token, token);
        assert_eq!(session.expires_at - session.created_at, 60);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_token_collision_is_reported() {
        let store = Arc::new(SessionStore::new());
        let (_, token, _rx) = new_session(&store);

        let (handle, _rx2) = TunnelHandle::new(1);
        let result = store.create(token.clone(), handle, TTL);
        assert!(matches!(result, Err(TunnelError::TokenCollision(t)) if t == token));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_unknown_endpoint() {
        let store = Arc::new(SessionStore::new());
        assert_eq!(store.lookup_by_endpoint("V1StGXR8_Z5jdHi6B-myT"), None);
        assert!(store.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_closes_connection() {
        let store = Arc::new(SessionStore::new());
        let (session_id, token, _rx) = new_session(&store);
        let session = store.get(&session_id).unwrap();

        assert!(store.remove(&session_id));
        assert!(session.connection().is_closed());
        assert_eq!(store.lookup_by_endpoint(&token), None);
        assert!(store.is_empty());

        // Second removal and removal of a never-existing session are no-ops
        assert!(!store.remove(&session_id));
        assert!(!store.remove("never-existed"));
    }

    #[tokio::test]
    async fn test_remove_releases_waiters() {
        let store = Arc::new(SessionStore::new());
        let (session_id, _, _rx) = new_session(&store);
        let session = store.get(&session_id).unwrap();

        let (_, receiver) = session.register_request().unwrap();
        store.remove(&session_id);

        assert!(receiver.await.is_err());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_by_request_id() {
        let store = Arc::new(SessionStore::new());
        let (session_id, _, _rx) = new_session(&store);
        let session = store.get(&session_id).unwrap();

        let (first_id, first_rx) = session.register_request().unwrap();
        let (second_id, second_rx) = session.register_request().unwrap();
        assert_ne!(first_id, second_id);
        assert_eq!(session.pending_count(), 2);

        // Answer the second request first
        let second = HttpResponse::new(201).with_text_body("second");
        let first = HttpResponse::new(200).with_text_body("first");
        assert_eq!(session.complete_request(&second_id, second.clone()), Delivery::Delivered);
        assert_eq!(session.complete_request(&first_id, first.clone()), Delivery::Delivered);

        assert_eq!(second_rx.await.unwrap(), second);
        assert_eq!(first_rx.await.unwrap(), first);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_and_abandoned_responses() {
        let store = Arc::new(SessionStore::new());
        let (session_id, _, _rx) = new_session(&store);
        let session = store.get(&session_id).unwrap();

        // Unknown ID
        assert_eq!(
            session.complete_request("never-issued", HttpResponse::new(200)),
            Delivery::Unknown
        );

        // Waiter dropped its receiver but the guard has not run yet
        let (request_id, receiver) = session.register_request().unwrap();
        drop(receiver);
        assert_eq!(
            session.complete_request(&request_id, HttpResponse::new(200)),
            Delivery::Abandoned
        );
        assert_eq!(session.pending_count(), 0);

        // Duplicate response for an already delivered ID
        let (request_id, _receiver) = session.register_request().unwrap();
        session.complete_request(&request_id, HttpResponse::new(200));
        assert_eq!(
            session.complete_request(&request_id, HttpResponse::new(200)),
            Delivery::Unknown
        );
    }

    #[tokio::test]
    async fn test_pending_guard_evicts_on_drop() {
        let store = Arc::new(SessionStore::new());
        let (session_id, _, _rx) = new_session(&store);
        let session = store.get(&session_id).unwrap();

        let (request_id, _receiver) = session.register_request().unwrap();
        {
            let _guard = PendingGuard::new(session.clone(), request_id.clone());
            assert_eq!(session.pending_count(), 1);
        }
        assert_eq!(session.pending_count(), 0);
        assert_eq!(
            session.complete_request(&request_id, HttpResponse::new(200)),
            Delivery::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_at_ttl_boundary() {
        let store = Arc::new(SessionStore::new());
        let (handle, _rx) = TunnelHandle::new(1);
        let token = generate_endpoint_token();
        let ttl = Duration::from_secs(60);
        let session_id = store.create(token.clone(), handle.clone(), ttl).unwrap();

        // Let the expiry task start
        tokio::task::yield_now().await;

        tokio::time::advance(ttl - Duration::from_millis(1)).await;
        assert_eq!(store.lookup_by_endpoint(&token), Some(session_id.clone()));
        assert!(!handle.is_closed());

        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.lookup_by_endpoint(&token), None);
        assert!(store.get(&session_id).is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_is_not_refreshed_by_activity() {
        let store = Arc::new(SessionStore::new());
        let (handle, _rx) = TunnelHandle::new(1);
        let token = generate_endpoint_token();
        let session_id = store
            .create(token.clone(), handle.clone(), Duration::from_secs(10))
            .unwrap();
        tokio::task::yield_now().await;

        for _ in 0..9 {
            tokio::time::advance(Duration::from_secs(1)).await;
            let session = store.get(&session_id).unwrap();
            let (request_id, _rx) = session.register_request().unwrap();
            session.complete_request(&request_id, HttpResponse::new(200));
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(store.get(&session_id).is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_tunnel_handle_send_after_close() {
        let (handle, mut rx) = TunnelHandle::new(4);
        let info = SessionInfo::new(
            "s".to_string(),
            "t".to_string(),
            "http://localhost/t".to_string(),
            0,
            60,
        );

        handle
            .send(Message::SessionEstablished(info.clone()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Message::SessionEstablished(info.clone())));

        handle.close();
        handle.closed().await;
        assert!(matches!(
            handle.send(Message::SessionEstablished(info)).await,
            Err(TunnelError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_session_info_public_url() {
        let store = Arc::new(SessionStore::new());
        let (session_id, token, _rx) = new_session(&store);
        let session = store.get(&session_id).unwrap();

        let info = session.info("http://localhost:3000/");
        assert_eq!(info.public_url, format!("http://localhost:3000/{}", token));
        assert_eq!(info.session_id, session_id);
    }
}
