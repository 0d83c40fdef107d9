//! # Response Matching
//!
//! Purpose: Decide whether the head of an accumulating inbound buffer holds
//! one complete response, and if so how many bytes belong to it.
//!
//! ## Design Principles
//! 1. **Leaf Crate**: No knowledge of sockets or queues; callers pass bytes in.
//! 2. **Tagged Rules**: `FulfillRule` is an enum, so every rule kind is
//!    handled exhaustively at compile time.
//! 3. **Sticky Errors**: `Matcher` stops advancing on the first failure and
//!    reports "not ready" instead of panicking on partial input.

mod error;
mod matcher;
mod rule;

pub use error::{MatchError, MatchResult};
pub use matcher::Matcher;
pub use rule::{FulfillRule, Scan};
