//! Error handling and sanitization
//!
//! This module maps broker errors onto HTTP responses for public callers while
//! logging full details internally, so tunnel internals never leak to clients.

use bytes::Bytes;
use http::{Response, StatusCode, header};
use http_body_util::Full;
use tracing::error;
use tunnel_common::TunnelError;

/// Response body type used by every ingress response
pub type Body = Full<Bytes>;

/// Map an error onto the status code returned to the HTTP caller
pub fn status_for_error(e: &TunnelError) -> StatusCode {
    match e {
        TunnelError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        TunnelError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        TunnelError::SessionClosed(_)
        | TunnelError::ConnectionError(_)
        | TunnelError::InvalidMessage(_)
        | TunnelError::SerializationError(_)
        | TunnelError::Base64Error(_)
        | TunnelError::LocalServiceUnavailable(_) => StatusCode::BAD_GATEWAY,
        TunnelError::IdExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Check if an error can be shown to the client as-is
pub fn is_safe_error(e: &TunnelError) -> bool {
    matches!(e, TunnelError::Timeout | TunnelError::SessionNotFound(_))
}

/// Sanitize error messages for client responses
///
/// Logs the full error internally but returns a generic message tied to the status.
pub fn sanitize_error(e: &TunnelError) -> String {
    let status = status_for_error(e);
    error!(status = status.as_u16(), "Tunnel error: {}", e);

    match status {
        StatusCode::GATEWAY_TIMEOUT => "Gateway Timeout: No response from agent".to_string(),
        StatusCode::BAD_GATEWAY => "Bad Gateway: Agent unavailable".to_string(),
        StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable".to_string(),
        _ => "Internal server error".to_string(),
    }
}

/// Get a user-friendly error message
pub fn get_client_error_message(e: &TunnelError) -> String {
    if is_safe_error(e) {
        e.to_string()
    } else {
        sanitize_error(e)
    }
}

/// Build the plain-text error response for `e`
pub fn error_response(e: &TunnelError) -> Response<Body> {
    let status = status_for_error(e);
    let message = get_client_error_message(e);
    plain_response(status, message, Some(status.canonical_reason().unwrap_or("Error")))
}

/// Build a plain-text response, optionally tagged with an `x-tunnel-error` header
pub fn plain_response(
    status: StatusCode,
    body: impl Into<Bytes>,
    tunnel_error: Option<&'static str>,
) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Some(reason) = tunnel_error {
        response
            .headers_mut()
            .insert("x-tunnel-error", header::HeaderValue::from_static(reason));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for_error(&TunnelError::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for_error(&TunnelError::SessionNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for_error(&TunnelError::SessionClosed("gone".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for_error(&TunnelError::IdExhausted(8)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_error(&TunnelError::TokenCollision("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_sanitize_error_hides_details() {
        let err = TunnelError::SessionClosed("writer for 10.0.1.5:51234 exited".to_string());
        let sanitized = sanitize_error(&err);

        assert_eq!(sanitized, "Bad Gateway: Agent unavailable");
        assert!(!sanitized.contains("10.0.1.5"));
    }

    #[test]
    fn test_client_error_message() {
        let msg = get_client_error_message(&TunnelError::Timeout);
        assert_eq!(msg, "Timeout waiting for response");

        let msg = get_client_error_message(&TunnelError::HttpError("secret".into()));
        assert_eq!(msg, "Internal server error");
    }

    #[test]
    fn test_error_response_headers() {
        let response = error_response(&TunnelError::Timeout);

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("x-tunnel-error").unwrap(),
            "Gateway Timeout"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
