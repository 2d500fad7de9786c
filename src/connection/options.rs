// src/connection/options.rs

use crate::config::ClientConfig;
use std::time::Duration;

/// Runtime settings for one logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    /// `None` means no response is expected: requests return right after sending.
    pub receive_timeout: Option<Duration>,
    /// Start in persistent mode instead of one socket per operation.
    pub persistent: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Some(Duration::from_secs(5)),
            persistent: false,
        }
    }
}

impl From<&ClientConfig> for ConnectionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            receive_timeout: u64::try_from(config.receive_timeout_ms)
                .ok()
                .map(Duration::from_millis),
            persistent: config.persistent,
        }
    }
}
