use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TunnelError};
use crate::validation::validate_request_id;

/// Represents an HTTP request forwarded from the public endpoint to the agent
///
/// Payload layout inside a request frame:
///
/// ```text
/// <request id>\n
/// <METHOD> <uri> HTTP/<version>\n
/// <Header-Name>: <value>\n   (zero or more)
/// \n
/// <body bytes>
/// ```
///
/// The surrounding frame carries the payload length, so the body may contain
/// any bytes including newlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Unique identifier to correlate request and response
    pub request_id: String,

    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    pub method: String,

    /// Forwarded path including query string, with the endpoint token stripped
    /// Example: "/api/v1/users?limit=10"
    pub uri: String,

    /// Protocol version without the "HTTP/" prefix, e.g. "1.1"
    pub version: String,

    /// Headers in arrival order as `(Header-Name, value)` pairs
    pub headers: Vec<(String, String)>,

    /// Raw request body, empty for requests without body
    pub body: Bytes,
}

impl HttpRequest {
    /// Create a new HTTP/1.1 request without headers or body
    pub fn new(request_id: String, method: String, uri: String) -> Self {
        Self {
            request_id,
            method,
            uri,
            version: "1.1".to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Check if the request has a body
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// The request line as it appears on the wire
    pub fn request_line(&self) -> String {
        format!("{} {} HTTP/{}", self.method, self.uri, self.version)
    }

    /// Serialize into a request frame payload
    pub fn encode_payload(&self) -> Bytes {
        let head_len = self.request_id.len()
            + self.request_line().len()
            + self
                .headers
                .iter()
                .map(|(name, value)| name.len() + value.len() + 3)
                .sum::<usize>()
            + 3;
        let mut buf = BytesMut::with_capacity(head_len + self.body.len());

        buf.put_slice(self.request_id.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(self.request_line().as_bytes());
        buf.put_u8(b'\n');
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);

        buf.freeze()
    }

    /// Parse a request frame payload
    pub fn parse_payload(payload: &Bytes) -> Result<Self> {
        let mut cursor = 0;

        let request_id = next_line(payload, &mut cursor)
            .ok_or_else(|| TunnelError::InvalidMessage("Missing request ID line".to_string()))?;
        validate_request_id(&request_id)
            .map_err(|e| TunnelError::InvalidMessage(e.to_string()))?;

        let request_line = next_line(payload, &mut cursor)
            .ok_or_else(|| TunnelError::InvalidMessage("Missing request line".to_string()))?;
        let (method, uri, version) = parse_request_line(&request_line)?;

        let mut headers = Vec::new();
        while let Some(line) = next_line(payload, &mut cursor) {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                TunnelError::InvalidMessage(format!("Malformed header line: {}", line))
            })?;
            headers.push((name.trim().to_string(), value.trim_start().to_string()));
        }

        Ok(Self {
            request_id,
            method,
            uri,
            version,
            headers,
            body: payload.slice(cursor.min(payload.len())..),
        })
    }
}

/// Read one `\n`-terminated UTF-8 line starting at `cursor`, advancing past the newline
///
/// A trailing line without `\n` is returned as-is. Returns `None` at end of input.
fn next_line(payload: &[u8], cursor: &mut usize) -> Option<String> {
    if *cursor >= payload.len() {
        return None;
    }

    let rest = &payload[*cursor..];
    let (line, advance) = match rest.iter().position(|&b| b == b'\n') {
        Some(pos) => (&rest[..pos], pos + 1),
        None => (rest, rest.len()),
    };
    *cursor += advance;

    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some(String::from_utf8_lossy(line).into_owned())
}

fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let mut parts = line.splitn(3, ' ');
    let (Some(method), Some(uri), Some(protocol)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(TunnelError::InvalidMessage(format!(
            "Malformed request line: {}",
            line
        )));
    };

    let version = protocol.strip_prefix("HTTP/").ok_or_else(|| {
        TunnelError::InvalidMessage(format!("Malformed protocol version: {}", protocol))
    })?;

    if method.is_empty() || !uri.starts_with('/') {
        return Err(TunnelError::InvalidMessage(format!(
            "Malformed request line: {}",
            line
        )));
    }

    Ok((method.to_string(), uri.to_string(), version.to_string()))
}
