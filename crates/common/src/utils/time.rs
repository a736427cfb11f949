use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds
pub fn current_timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Calculate an expiry timestamp (current time + duration in seconds)
pub fn calculate_expiry(duration_secs: u64) -> i64 {
    current_timestamp_secs() + duration_secs as i64
}
