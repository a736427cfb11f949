use rand::{Rng, thread_rng};

use crate::constants::TOKEN_LENGTH;

/// URL-safe alphabet shared by every generated identifier
const URL_SAFE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Generate a random, URL-safe token of the given length
pub fn generate_token(len: usize) -> String {
    let mut rng = thread_rng();
    (0..len)
        .map(|_| URL_SAFE_ALPHABET[rng.gen_range(0..URL_SAFE_ALPHABET.len())] as char)
        .collect()
}

/// Generate a private session identifier
pub fn generate_session_id() -> String {
    generate_token(TOKEN_LENGTH)
}

/// Generate the public endpoint token embedded in ingress URLs
pub fn generate_endpoint_token() -> String {
    generate_token(TOKEN_LENGTH)
}

/// Generate a request identifier used to correlate request and response frames
pub fn generate_request_id() -> String {
    generate_token(TOKEN_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_token_length() {
        assert_eq!(generate_token(12).len(), 12);
        assert_eq!(generate_endpoint_token().len(), TOKEN_LENGTH);
        assert_eq!(generate_session_id().len(), TOKEN_LENGTH);
        assert_eq!(generate_request_id().len(), TOKEN_LENGTH);
    }

    #[test]
    fn test_generate_token_format() {
        let token = generate_endpoint_token();

        // Should only contain URL-safe characters
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        );
    }

    #[test]
    fn test_generate_endpoint_token_uniqueness() {
        let mut tokens = HashSet::new();

        // Generate 1000 tokens and check they're all unique
        for _ in 0..1000 {
            let token = generate_endpoint_token();
            assert!(tokens.insert(token), "Generated duplicate endpoint token");
        }
    }

    #[test]
    fn test_generate_request_id_uniqueness() {
        let mut ids = HashSet::new();

        for _ in 0..1000 {
            let id = generate_request_id();
            assert!(ids.insert(id), "Generated duplicate request ID");
        }
    }

    #[test]
    fn test_session_id_differs_from_endpoint_token() {
        assert_ne!(generate_session_id(), generate_endpoint_token());
    }
}
