//! # Connection Configuration
//!
//! Purpose: Describe where to connect and how to recover from a lost
//! connection, in a form that can be loaded from JSON.
//!
//! ## Notes
//! - Only plain data lives here. The state observer and custom transports are
//!   supplied through `ConnectionBuilder`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default delay before a reconnect attempt, in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_MS: i64 = 5_000;

/// Connection target and reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Peer host name or IP, e.g. "127.0.0.1".
    pub host: String,
    /// Peer TCP port.
    pub port: u16,
    /// Delay before each reconnect attempt. Negative disables reconnection.
    pub connection_retry_interval_ms: i64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            connection_retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl ConnectionConfig {
    /// Creates a config for `host:port` with the default retry interval.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectionConfig {
            host: host.into(),
            port,
            ..ConnectionConfig::default()
        }
    }

    /// Overrides the retry interval; pass a negative value to disable retries.
    pub fn with_retry_interval_ms(mut self, millis: i64) -> Self {
        self.connection_retry_interval_ms = millis;
        self
    }

    /// Parses a config from JSON. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> ConfigResult<Self> {
        let config: ConnectionConfig = serde_json::from_str(raw)?;
        if config.host.trim().is_empty() {
            return Err(ConfigError::InvalidHost);
        }
        Ok(config)
    }

    /// Returns the reconnect delay, or `None` when reconnection is disabled.
    pub fn retry_interval(&self) -> Option<Duration> {
        u64::try_from(self.connection_retry_interval_ms)
            .ok()
            .map(Duration::from_millis)
    }
}
