use thiserror::Error;

/// Error types for the tunnel broker
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Endpoint token already in use: {0}")]
    TokenCollision(String),

    #[error("Failed to allocate a unique identifier after {0} attempts")]
    IdExhausted(usize),

    #[error("Local service unavailable: {0}")]
    LocalServiceUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("HTTP error: {0}")]
    HttpError(String),
}

impl TunnelError {
    /// Whether the error breaks framing and must end the tunnel connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::FrameTooLarge(..)
                | TunnelError::UnknownFrameKind(_)
                | TunnelError::Io(_)
                | TunnelError::ConnectionError(_)
        )
    }
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
