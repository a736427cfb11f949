//! ConnectHandler - Runs one agent tunnel connection
//!
//! Registers a session with a fresh endpoint token, announces it to the agent,
//! then pumps frames until the agent hangs up, a fatal protocol error occurs,
//! or the broker closes the connection (TTL expiry).

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use tunnel_common::constants::MAX_ID_ATTEMPTS;
use tunnel_common::{Message, Result, TunnelCodec, TunnelError, generate_endpoint_token};

use super::{handle_disconnect, handle_response};
use crate::Broker;
use crate::store::{Session, TunnelHandle};

type FrameSink<S> = SplitSink<Framed<S, TunnelCodec>, Message>;
type FrameStream<S> = SplitStream<Framed<S, TunnelCodec>>;

/// Handler for a newly accepted tunnel connection
///
/// Resolves once the connection has ended and its session has been removed.
pub async fn handle_connect<S>(stream: S, peer: SocketAddr, broker: Broker) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (handle, outbound_rx) = TunnelHandle::new(broker.config.outbound_queue_capacity);

    let session_id = register_session(&broker, handle.clone()).inspect_err(|e| {
        warn!(%peer, error = %e, "Refusing tunnel connection");
    })?;
    let session = broker
        .store
        .get(&session_id)
        .ok_or_else(|| TunnelError::SessionNotFound(session_id.clone()))?;

    info!(
        %session_id,
        endpoint_token = %session.endpoint_token,
        %peer,
        "[TUNNEL] NEW: session → endpoint"
    );

    let codec = TunnelCodec::new(broker.config.max_frame_bytes);
    let (sink, frames) = Framed::new(stream, codec).split();

    // Queued before the writer starts, so it is always the first frame out
    let announcement = session.info(&broker.config.public_url);
    let public_url = announcement.public_url.clone();
    let result = match handle.send(Message::SessionEstablished(announcement)).await {
        Ok(()) => {
            info!(%session_id, %public_url, "Public URL assigned");
            let writer = tokio::spawn(write_loop(
                sink,
                outbound_rx,
                handle.clone(),
                session_id.clone(),
            ));
            let result = read_loop(frames, &session, &handle).await;
            handle.close();
            if let Err(e) = writer.await {
                warn!(%session_id, error = %e, "Tunnel writer task failed");
            }
            result
        }
        Err(e) => Err(e),
    };

    handle_disconnect(&broker.store, &session_id);
    result
}

/// Create the session, retrying with a fresh endpoint token on collision
fn register_session(broker: &Broker, handle: TunnelHandle) -> Result<String> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let endpoint_token = generate_endpoint_token();
        match broker
            .store
            .create(endpoint_token, handle.clone(), broker.config.session_ttl)
        {
            Ok(session_id) => return Ok(session_id),
            Err(TunnelError::TokenCollision(token)) => {
                debug!(endpoint_token = %token, "Endpoint token collision, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(TunnelError::IdExhausted(MAX_ID_ATTEMPTS))
}

/// Decode inbound frames until the connection ends
async fn read_loop<S>(
    mut frames: FrameStream<S>,
    session: &Session,
    handle: &TunnelHandle,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = handle.closed() => {
                debug!(session_id = %session.session_id, "Tunnel closed by broker");
                return Ok(());
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => handle_response(session, frame),
            Some(Err(e)) if e.is_fatal() => {
                warn!(
                    session_id = %session.session_id,
                    error = %e,
                    "Protocol error on tunnel, closing connection"
                );
                return Err(e);
            }
            Some(Err(e)) => {
                warn!(session_id = %session.session_id, error = %e, "Dropping undecodable frame");
            }
            None => {
                debug!(session_id = %session.session_id, "Agent closed the tunnel");
                return Ok(());
            }
        }
    }
}

/// Sole owner of the socket's write half
async fn write_loop<S>(
    mut sink: FrameSink<S>,
    mut outbound_rx: mpsc::Receiver<Message>,
    handle: TunnelHandle,
    session_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = handle.closed() => break,
            message = outbound_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match sink.send(message).await {
            Ok(()) => {}
            // Encoding failures affect a single message only
            Err(e @ (TunnelError::FrameTooLarge(..) | TunnelError::SerializationError(_))) => {
                warn!(%session_id, error = %e, "Dropping outbound message");
            }
            Err(e) => {
                warn!(%session_id, error = %e, "Tunnel write failed, closing connection");
                handle.close();
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(%session_id, error = %e, "Error shutting down tunnel write half");
    }
}
