use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Encode bytes to Base64 string
pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

/// Decode Base64 string to bytes
pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

/// Choose how a response body travels in the JSON line of a response frame
///
/// UTF-8 bodies are carried verbatim; anything else is Base64. Returns the
/// body string and whether it is Base64 encoded.
pub fn encode_response_body(body: &[u8]) -> (String, bool) {
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_string(), false),
        Err(_) => (encode_body(body), true),
    }
}
