//! # Fulfillment Rules
//!
//! Purpose: Express "the first N bytes of this buffer are one complete
//! response" as a closed set of rule kinds.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: Each variant carries its own payload and is
//!    evaluated by one function, no runtime type probing.
//! 2. **Cheap Clones**: Patterns and scans are reference counted so a rule can
//!    be cloned into every request that uses it.
//!
//! ## Caller Obligations
//! - `Pattern` measures the response by the length of capture group 1, not the
//!   whole match. Anchor the pattern at `^` and let group 1 span the response,
//!   e.g. `^(\+OK\r\n)`.

use std::fmt;
use std::sync::Arc;

use regex::bytes::Regex;

use crate::error::{MatchError, MatchResult};
use crate::matcher::Matcher;

type ScanFn = dyn Fn(&mut Matcher<'_>) + Send + Sync;

/// Programmable cursor scan composed by the caller.
#[derive(Clone)]
pub struct Scan(Arc<ScanFn>);

impl Scan {
    pub fn new<F>(compose: F) -> Self
    where
        F: Fn(&mut Matcher<'_>) + Send + Sync + 'static,
    {
        Scan(Arc::new(compose))
    }

    /// Runs the composition on a fresh cursor and returns the ready length.
    pub fn ready_len(&self, buffer: &[u8]) -> Option<usize> {
        let mut matcher = Matcher::new(buffer);
        (self.0)(&mut matcher);
        matcher.evaluate()
    }

    /// Re-runs the composition to recover the captured values.
    ///
    /// Typically called on a response the same scan already accepted.
    pub fn values(&self, buffer: &[u8]) -> Vec<String> {
        let mut matcher = Matcher::new(buffer);
        (self.0)(&mut matcher);
        matcher.values()
    }
}

impl fmt::Debug for Scan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Scan(..)")
    }
}

/// Decides how many leading bytes of the inbound buffer form one response.
#[derive(Debug, Clone, Default)]
pub enum FulfillRule {
    /// Everything received so far is the response.
    #[default]
    Remaining,
    /// Ready once at least `N` bytes are buffered; the response is `N` bytes.
    Length(usize),
    /// Ready when the pattern matches; the response is capture group 1.
    Pattern(Regex),
    /// Ready when the composed cursor scan succeeds.
    Scan(Scan),
}

impl FulfillRule {
    pub fn length(len: usize) -> Self {
        FulfillRule::Length(len)
    }

    /// Compiles `pattern` into a pattern rule.
    ///
    /// # Errors
    /// `MatchError::InvalidPattern` if it does not compile,
    /// `MatchError::MissingCaptureGroup` if it has no capturing group.
    pub fn pattern(pattern: &str) -> MatchResult<Self> {
        Self::from_regex(Regex::new(pattern)?)
    }

    /// Wraps an already compiled pattern.
    pub fn from_regex(regex: Regex) -> MatchResult<Self> {
        // captures_len counts the implicit whole-match group.
        if regex.captures_len() < 2 {
            return Err(MatchError::MissingCaptureGroup);
        }
        Ok(FulfillRule::Pattern(regex))
    }

    pub fn scan<F>(compose: F) -> Self
    where
        F: Fn(&mut Matcher<'_>) + Send + Sync + 'static,
    {
        FulfillRule::Scan(Scan::new(compose))
    }

    /// Returns the ready length for `buffer`, or `None` if more bytes are needed.
    ///
    /// A `Some(0)` result is possible (e.g. `Remaining` on an empty buffer);
    /// callers treat it as not ready.
    pub fn ready_len(&self, buffer: &[u8]) -> Option<usize> {
        match self {
            FulfillRule::Remaining => Some(buffer.len()),
            FulfillRule::Length(len) => (buffer.len() >= *len).then_some(*len),
            FulfillRule::Pattern(regex) => regex
                .captures(buffer)
                .and_then(|captures| captures.get(1))
                .map(|group| group.len()),
            FulfillRule::Scan(scan) => scan.ready_len(buffer),
        }
    }
}

impl From<usize> for FulfillRule {
    fn from(len: usize) -> Self {
        FulfillRule::Length(len)
    }
}

impl From<Scan> for FulfillRule {
    fn from(scan: Scan) -> Self {
        FulfillRule::Scan(scan)
    }
}
