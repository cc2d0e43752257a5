use std::time::Duration;

use duet_common::config::{fallback_ice_servers, IceServer};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connections silent for longer than this are evicted.
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Hard cap on connection age. `None` disables it.
    pub max_connection_lifetime: Option<Duration>,
    pub max_message_bytes: usize,
    /// Served on `/api/ice-servers`.
    pub ice_servers: Vec<IceServer>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_connection_lifetime: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            ice_servers: fallback_ice_servers(),
        }
    }
}
