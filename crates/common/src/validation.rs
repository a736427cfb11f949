//! Input validation for externally supplied identifiers and paths
//!
//! Endpoint tokens arrive from the public internet and request IDs arrive from
//! agents; both are checked before they are used as map keys or logged.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Regex for validating endpoint tokens (21 URL-safe characters)
static ENDPOINT_TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{21}$").expect("static regex"));

/// Regex for validating request IDs echoed back by agents
static REQUEST_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

/// Maximum length for forwarded HTTP paths (including query string)
pub const MAX_PATH_LENGTH: usize = 8192;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid endpoint token format: {0}")]
    InvalidEndpointToken(String),

    #[error("Invalid request ID format: {0}")]
    InvalidRequestId(String),

    #[error("Path too long: {0} bytes (max: {1})")]
    PathTooLong(usize, usize),
}

/// Validate endpoint token format
///
/// Endpoint tokens are exactly 21 characters from the URL-safe alphabet.
///
/// # Examples
///
/// ```
/// use tunnel_common::validation::validate_endpoint_token;
///
/// assert!(validate_endpoint_token("V1StGXR8_Z5jdHi6B-myT").is_ok());
/// assert!(validate_endpoint_token("favicon.ico").is_err());
/// ```
pub fn validate_endpoint_token(token: &str) -> Result<(), ValidationError> {
    if !ENDPOINT_TOKEN_REGEX.is_match(token) {
        return Err(ValidationError::InvalidEndpointToken(
            token.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate request ID format
///
/// Request IDs are 1 to 64 URL-safe characters, so they can never smuggle a
/// newline into the frame header.
pub fn validate_request_id(id: &str) -> Result<(), ValidationError> {
    if !REQUEST_ID_REGEX.is_match(id) {
        return Err(ValidationError::InvalidRequestId(
            id.chars().take(50).collect::<String>(),
        ));
    }
    Ok(())
}

/// Validate a forwarded path
///
/// - Enforces length limits
/// - Ensures path starts with /
pub fn validate_path(path: &str) -> Result<String, ValidationError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong(path.len(), MAX_PATH_LENGTH));
    }

    if path.is_empty() {
        Ok("/".to_string())
    } else if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("/{}", path))
    }
}
