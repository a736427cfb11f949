use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TunnelError};
use crate::utils::{decode_body, encode_body, encode_response_body};

/// Represents the response from the local service, sent back through the tunnel
///
/// Travels as the JSON second line of a response frame, after the request ID line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code (200, 404, 500, etc.)
    #[serde(rename = "status", alias = "statusCode", alias = "status_code")]
    pub status_code: u16,

    /// Response headers; each value may be a single string or a list of strings
    #[serde(default, deserialize_with = "deserialize_header_map")]
    pub headers: HashMap<String, Vec<String>>,

    /// Response body, Base64 encoded when `is_base64_encoded` is set
    #[serde(default)]
    pub body: String,

    /// Whether `body` carries Base64 encoded bytes
    #[serde(default, alias = "isBase64Encoded")]
    pub is_base64_encoded: bool,
}

impl HttpResponse {
    /// Create a new HTTP response
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: String::new(),
            is_base64_encoded: false,
        }
    }

    /// Attach a binary body, stored as Base64
    pub fn with_binary_body(mut self, body: &[u8]) -> Self {
        self.body = encode_body(body);
        self.is_base64_encoded = true;
        self
    }

    /// Attach a body, verbatim when it is UTF-8 and Base64 otherwise
    pub fn with_body(mut self, body: &[u8]) -> Self {
        (self.body, self.is_base64_encoded) = encode_response_body(body);
        self
    }

    /// Attach a text body, stored verbatim
    pub fn with_text_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self.is_base64_encoded = false;
        self
    }

    /// Decode the body into raw bytes
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        if self.is_base64_encoded {
            Ok(decode_body(&self.body)?)
        } else {
            Ok(self.body.clone().into_bytes())
        }
    }

    /// Check if the response is a server error (5xx status code)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }

    /// Parse a response frame payload: request ID line followed by the JSON line
    pub fn parse_payload(payload: &[u8]) -> Result<(String, Self)> {
        let newline = payload.iter().position(|&b| b == b'\n').ok_or_else(|| {
            TunnelError::InvalidMessage("Response frame is missing its body line".to_string())
        })?;

        let request_id = std::str::from_utf8(&payload[..newline])
            .map_err(|e| TunnelError::InvalidMessage(format!("Request ID is not UTF-8: {}", e)))?
            .trim_end_matches('\r')
            .to_string();
        crate::validation::validate_request_id(&request_id)
            .map_err(|e| TunnelError::InvalidMessage(e.to_string()))?;

        let response: HttpResponse = serde_json::from_slice(&payload[newline + 1..])?;
        Ok((request_id, response))
    }

    /// Serialize into a response frame payload tagged with `request_id`
    pub fn encode_payload(&self, request_id: &str) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut payload = Vec::with_capacity(request_id.len() + 1 + json.len());
        payload.extend_from_slice(request_id.as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(&json);
        Ok(payload)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn deserialize_header_map<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, OneOrMany> = HashMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, values)| match values {
            OneOrMany::One(value) => (name, vec![value]),
            OneOrMany::Many(values) => (name, values),
        })
        .collect())
}
