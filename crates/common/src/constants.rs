/// Default public HTTP listen address
pub const DEFAULT_INGRESS_ADDR: &str = "0.0.0.0:3000";

/// Default tunnel listen address agents dial into
pub const DEFAULT_TUNNEL_ADDR: &str = "0.0.0.0:8080";

/// Absolute session lifetime; sessions are not refreshed on activity (60 seconds)
pub const SESSION_TTL_SECS: u64 = 60;

/// Request timeout waiting for the agent to answer (30 seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Length of generated session ids, endpoint tokens and request ids
pub const TOKEN_LENGTH: usize = 21;

/// How many fresh identifiers to try before giving up on a collision
pub const MAX_ID_ATTEMPTS: usize = 8;

/// Maximum tunnel frame size (16 MB)
pub const MAX_FRAME_SIZE_BYTES: usize = 16 * 1024 * 1024;

/// Maximum request/response body size (8 MB)
pub const MAX_BODY_SIZE_BYTES: usize = 8 * 1024 * 1024;

/// Capacity of the per-connection outbound frame queue
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff reconnection (60 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 60000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;
