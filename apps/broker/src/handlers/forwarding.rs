//! ForwardingHandler - Handles public HTTP requests
//!
//! This module resolves the endpoint token in the request path, frames the
//! request onto the owning agent's tunnel and waits for the correlated
//! response. If no response arrives within the timeout, it returns a 504
//! Gateway Timeout.

use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body as HttpBody;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tunnel_common::validation::{validate_endpoint_token, validate_path};
use tunnel_common::{Message, Result, TunnelError};

use crate::error_handling::{Body, error_response, plain_response};
use crate::store::{PendingGuard, Session};
use crate::{
    Broker, LANDING_PAGE, NOT_FOUND_PAGE, build_http_request, build_http_response,
    extract_endpoint_token_from_path, forwarded_uri, html_response,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handler for public HTTP requests
pub async fn handle_forwarding<B>(
    request: Request<B>,
    broker: Broker,
) -> std::result::Result<Response<Body>, Infallible>
where
    B: HttpBody,
    B::Error: Into<BoxError>,
{
    let (parts, body) = request.into_parts();
    let path = parts.uri.path();

    let Some(endpoint_token) = extract_endpoint_token_from_path(path) else {
        return Ok(html_response(StatusCode::OK, LANDING_PAGE));
    };

    let Some(session) = resolve_session(&broker, endpoint_token) else {
        debug!(endpoint_token, "No live session for endpoint");
        return Ok(html_response(StatusCode::NOT_FOUND, NOT_FOUND_PAGE));
    };

    let uri = match validate_path(&forwarded_uri(path, parts.uri.query())) {
        Ok(uri) => uri,
        Err(e) => {
            warn!(endpoint_token, error = %e, "Rejecting request path");
            return Ok(plain_response(StatusCode::URI_TOO_LONG, "URI Too Long", None));
        }
    };

    let max_body = broker.config.max_body_bytes;
    if declared_length(&parts.headers).is_some_and(|length| length > max_body) {
        return Ok(payload_too_large());
    }
    let body = match Limited::new(body, max_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Ok(payload_too_large());
        }
        Err(e) => {
            debug!(endpoint_token, error = %e, "Failed to read request body");
            return Ok(plain_response(StatusCode::BAD_REQUEST, "Bad Request", None));
        }
    };

    debug!(
        endpoint_token,
        session_id = %session.session_id,
        method = %parts.method,
        %uri,
        "Forwarding request"
    );

    let forwarded = forward(&broker, session, |request_id| {
        build_http_request(
            request_id,
            &parts.method,
            uri,
            parts.version,
            &parts.headers,
            body,
        )
    })
    .await;

    Ok(forwarded.unwrap_or_else(|e| error_response(&e)))
}

/// Resolve a path token to its live session; invalid tokens never match
fn resolve_session(broker: &Broker, endpoint_token: &str) -> Option<Arc<Session>> {
    validate_endpoint_token(endpoint_token).ok()?;
    let session_id = broker.store.lookup_by_endpoint(endpoint_token)?;
    broker.store.get(&session_id)
}

/// Send the request to the agent and wait for its correlated response
async fn forward<F>(broker: &Broker, session: Arc<Session>, build: F) -> Result<Response<Body>>
where
    F: FnOnce(String) -> tunnel_common::HttpRequest,
{
    let (request_id, receiver) = session.register_request()?;
    let _guard = PendingGuard::new(session.clone(), request_id.clone());
    let request = build(request_id.clone());
    let started = Instant::now();

    let exchange = async {
        session
            .connection()
            .send(Message::HttpRequest(request))
            .await?;
        receiver
            .await
            .map_err(|_| TunnelError::SessionClosed(session.session_id.clone()))
    };

    let response = match tokio::time::timeout(broker.config.request_timeout, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(
                session_id = %session.session_id,
                %request_id,
                timeout_secs = broker.config.request_timeout.as_secs(),
                "No response from agent before timeout"
            );
            return Err(TunnelError::Timeout);
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if response.is_server_error() {
        warn!(
            session_id = %session.session_id,
            %request_id,
            status = response.status_code,
            elapsed_ms,
            "Agent answered with a server error"
        );
    } else {
        info!(
            session_id = %session.session_id,
            %request_id,
            status = response.status_code,
            elapsed_ms,
            "Received response from agent"
        );
    }

    build_http_response(response)
}

fn declared_length(headers: &http::HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn payload_too_large() -> Response<Body> {
    plain_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        Bytes::from_static(b"Payload Too Large"),
        None,
    )
}
