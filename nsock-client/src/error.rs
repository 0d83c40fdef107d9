//! Error types surfaced to callers of the queued connection.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Why a request failed to produce a response.
#[derive(Debug, Error)]
pub enum SendError {
    /// No matching response arrived before the request's deadline.
    #[error("Timeout {}millis", .0.as_millis())]
    Timeout(Duration),
    /// The connection was torn down on purpose while the request was pending.
    #[error("DeadSocket")]
    DeadSocket,
    /// Writing the request to the transport failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

impl SendError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SendError::Timeout(_))
    }

    pub fn is_dead_socket(&self) -> bool {
        matches!(self, SendError::DeadSocket)
    }
}

/// Result type for a single request.
pub type SendResult<T> = Result<T, SendError>;

/// Errors raised while loading a `ConnectionConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("host must not be empty")]
    InvalidHost,
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
