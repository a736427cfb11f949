use serde::{Deserialize, Serialize};

/// Session details announced to the agent right after the tunnel is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Private session identifier (only ever shared with the owning agent)
    pub session_id: String,

    /// Public token embedded in the ingress URL path
    pub endpoint_token: String,

    /// Full public URL clients use to reach the agent
    pub public_url: String,

    /// Timestamp when the session was created (Unix epoch seconds)
    pub created_at: i64,

    /// Timestamp when the broker will close the session (Unix epoch seconds)
    pub expires_at: i64,
}

impl SessionInfo {
    /// Create a new session announcement
    pub fn new(
        session_id: String,
        endpoint_token: String,
        public_url: String,
        created_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            session_id,
            endpoint_token,
            public_url,
            created_at,
            expires_at,
        }
    }

    /// Remaining lifetime in seconds relative to `now`, zero once expired
    pub fn remaining_secs(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionInfo {
        SessionInfo::new(
            "sess_abc".to_string(),
            "V1StGXR8_Z5jdHi6B-myT".to_string(),
            "http://localhost:3000/V1StGXR8_Z5jdHi6B-myT".to_string(),
            1234567890,
            1234567950,
        )
    }

    #[test]
    fn test_session_info_creation() {
        let info = sample();

        assert_eq!(info.session_id, "sess_abc");
        assert_eq!(info.endpoint_token, "V1StGXR8_Z5jdHi6B-myT");
        assert_eq!(info.created_at, 1234567890);
        assert_eq!(info.expires_at, 1234567950);
    }

    #[test]
    fn test_remaining_secs() {
        let info = sample();

        assert_eq!(info.remaining_secs(1234567890), 60);
        assert_eq!(info.remaining_secs(1234567940), 10);
        assert_eq!(info.remaining_secs(1234567999), 0);
    }

    #[test]
    fn test_session_info_serialization() {
        let info = sample();

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains(r#""endpoint_token":"V1StGXR8_Z5jdHi6B-myT""#));
        assert!(json.contains(r#""expires_at":1234567950"#));

        let parsed: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
