//! Reverse tunnel broker
//!
//! Agents open a persistent tunnel connection and receive a public endpoint
//! token. Public HTTP requests addressed to `/{endpoint_token}/...` are framed
//! onto that tunnel, and the agent's correlated answer is written back to the
//! caller.

use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode, Version, header};
use http_body_util::Full;
use std::sync::Arc;
use tunnel_common::protocol::{HttpRequest, HttpResponse};
use tunnel_common::{Result, TunnelError, header_lines, map_to_headers};

pub mod config;
pub mod error_handling;
pub mod handlers;
pub mod server;
pub mod store;

pub use config::{Args, Config};
pub use error_handling::Body;
pub use store::{Delivery, PendingGuard, Session, SessionStore, TunnelHandle};

/// Static page served at the ingress root
pub const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Tunnel Broker</title></head>
<body>
<h1>Tunnel Broker</h1>
<p>Connect an agent to get a public endpoint, then send requests to
<code>/{endpoint}/your/path</code>.</p>
</body>
</html>
"#;

/// Body of the 404 returned for unknown endpoints
pub const NOT_FOUND_PAGE: &str = "<h1>404 Not Found</h1>";

/// State shared by the tunnel server and the ingress server
#[derive(Debug, Clone)]
pub struct Broker {
    pub store: Arc<SessionStore>,
    pub config: Arc<Config>,
}

impl Broker {
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(SessionStore::new()),
            config: Arc::new(config),
        }
    }
}

/// Extract the endpoint token from the first path segment
/// Example: "/abc123/api/users" -> Some("abc123"), "/" -> None
///
/// Only the bare root has no token; "//x" yields an empty token, which never resolves.
pub fn extract_endpoint_token_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    if rest.is_empty() {
        None
    } else {
        rest.split('/').next()
    }
}

/// Strip the endpoint token from the path before forwarding to the local service
/// Example: "/abc123/api/users" -> "/api/users"
/// Example: "/abc123" -> "/"
pub fn strip_endpoint_token_from_path(path: &str) -> String {
    let rest = path.strip_prefix('/').unwrap_or(path);
    let parts: Vec<&str> = rest.splitn(2, '/').collect();
    if parts.len() > 1 && !parts[1].is_empty() {
        format!("/{}", parts[1])
    } else {
        "/".to_string()
    }
}

/// Forwarded request target: stripped path plus the original query string
pub fn forwarded_uri(path: &str, query: Option<&str>) -> String {
    let stripped = strip_endpoint_token_from_path(path);
    match query {
        Some(q) => format!("{}?{}", stripped, q),
        None => stripped,
    }
}

/// Protocol version as written on the request line
pub fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

/// Build the request frame content for an ingress request
pub fn build_http_request(
    request_id: String,
    method: &Method,
    uri: String,
    version: Version,
    headers: &HeaderMap,
    body: Bytes,
) -> HttpRequest {
    let mut request = HttpRequest::new(request_id, method.to_string(), uri);
    request.version = version_label(version).to_string();
    request.headers = header_lines(headers);
    request.body = body;
    request
}

/// Convert the agent's answer into the response written to the HTTP caller
///
/// Framing headers are dropped since the body is re-framed by the server.
pub fn build_http_response(response: HttpResponse) -> Result<Response<Body>> {
    let status = StatusCode::from_u16(response.status_code).map_err(|_| {
        TunnelError::InvalidMessage(format!(
            "Agent returned invalid status code {}",
            response.status_code
        ))
    })?;
    let body = response.body_bytes()?;

    let mut headers = map_to_headers(&response.headers);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);

    let mut http_response = Response::new(Full::new(Bytes::from(body)));
    *http_response.status_mut() = status;
    *http_response.headers_mut() = headers;
    Ok(http_response)
}

/// Static HTML response (landing page and unknown endpoints)
pub fn html_response(status: StatusCode, page: &'static str) -> Response<Body> {
    let mut response = Response::new(Full::new(Bytes::from_static(page.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}
