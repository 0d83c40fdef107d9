//! Error types for building fulfillment rules.

use thiserror::Error;

/// Errors raised while constructing a `FulfillRule`.
///
/// Matching itself never fails: an unsatisfied rule simply reports that the
/// response is not ready yet.
#[derive(Debug, Error)]
pub enum MatchError {
    /// The pattern could not be compiled.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    /// The pattern has no capturing group to measure the response with.
    #[error("pattern must contain a capturing group spanning the response")]
    MissingCaptureGroup,
}

/// Result type for rule construction.
pub type MatchResult<T> = Result<T, MatchError>;
