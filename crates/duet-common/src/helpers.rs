//! Common helper functions for Duet.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_IDENTITY_LEN: usize = 128;

pub fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Millisecond duration from the environment, `default` when unset or invalid.
pub fn env_duration_ms(name: &str, default: Duration) -> Duration {
    env_u64(name).map(Duration::from_millis).unwrap_or(default)
}

/// Whether a string can name an endpoint on the relay.
///
/// Browsers stringify missing ids as `"undefined"`/`"null"`; those are
/// rejected along with empty, oversized, or path-breaking values.
pub fn is_valid_identity(id: &str) -> bool {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_IDENTITY_LEN {
        return false;
    }
    if trimmed.eq_ignore_ascii_case("undefined") || trimmed.eq_ignore_ascii_case("null") {
        return false;
    }
    !trimmed
        .chars()
        .any(|c| c.is_control() || c == '/' || c == '?' || c == '#')
}

/// Seconds since the Unix epoch as a float, the relay's timestamp format.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
