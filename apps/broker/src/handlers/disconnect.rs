//! DisconnectHandler - Cleans up after a tunnel connection ends
//!
//! Runs for every way a tunnel can end: the agent hanging up, a fatal protocol
//! error, or the session lifetime running out. Cleanup is best-effort and never
//! fails the caller.

use tracing::{debug, info};

use crate::store::SessionStore;

/// Remove the session owned by a finished tunnel connection
///
/// Returns whether this call removed it; an already-removed session (for
/// example after TTL expiry) is a no-op.
pub fn handle_disconnect(store: &SessionStore, session_id: &str) -> bool {
    if store.remove(session_id) {
        info!(%session_id, remaining = store.len(), "[TUNNEL] CLOSED: session removed");
        true
    } else {
        debug!(%session_id, "Session already removed");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TunnelHandle;
    use std::sync::Arc;
    use std::time::Duration;
    use tunnel_common::generate_endpoint_token;

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let store = Arc::new(SessionStore::new());
        let (handle, _rx) = TunnelHandle::new(1);
        let session_id = store
            .create(generate_endpoint_token(), handle.clone(), Duration::from_secs(60))
            .unwrap();

        assert!(handle_disconnect(&store, &session_id));
        assert!(handle.is_closed());
        assert!(!handle_disconnect(&store, &session_id));
        assert!(!handle_disconnect(&store, "never-existed"));
    }
}
