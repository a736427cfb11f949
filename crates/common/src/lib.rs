//! Common utilities and types for the reverse tunnel broker
//!
//! This crate provides the tunnel wire protocol, shared data structures and
//! utilities used by both the broker and the agent.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use models::SessionInfo;
pub use protocol::{Frame, FrameKind, HttpRequest, HttpResponse, Message, TunnelCodec};
pub use utils::{
    calculate_expiry, current_timestamp_secs, decode_body, encode_body, encode_response_body,
    generate_endpoint_token,
    generate_request_id, generate_session_id, header_lines, headers_to_map, map_to_headers,
};
