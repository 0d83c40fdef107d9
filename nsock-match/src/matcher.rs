//! # Cursor Matcher
//!
//! Purpose: Scan structured, multi-token responses (e.g. arrays of bulk
//! strings) with a small declarative cursor instead of a hand-written parser.
//!
//! ## Design Principles
//! 1. **Sticky Error**: The first failed step sets `error`; every later step is
//!    a no-op that keeps the flag, so compositions need no early returns.
//! 2. **Borrowed Input**: Captured values are slices of the input buffer, no
//!    copies until `values()` is asked for.
//! 3. **Pure**: A cursor only reads its buffer, so running the same
//!    composition twice over the same bytes yields identical results.
//!
//! ## Usage Notes
//!
//! ```rust
//! use nsock_match::Matcher;
//!
//! let buffer = b"*2\r\n$5\r\n12345\r\n$5\r\n34567\r\n";
//! let mut m = Matcher::new(buffer);
//! m.check("*").capture("\r\n").repeat(0, |_, m| {
//!     m.check("$").capture("\r\n").capture("\r\n");
//! });
//! assert_eq!(m.evaluate(), Some(buffer.len()));
//! assert_eq!(m.values(), vec!["2", "5", "12345", "5", "34567"]);
//! ```

use tracing::trace;

/// Cursor over one input buffer.
///
/// Construct one per match attempt and discard it after `evaluate()`.
#[derive(Debug, Clone)]
pub struct Matcher<'a> {
    buffer: &'a [u8],
    pos: usize,
    captured: Vec<&'a [u8]>,
    error: bool,
}

impl<'a> Matcher<'a> {
    /// Creates a cursor positioned at the start of `buffer`.
    pub fn new(buffer: &'a [u8]) -> Self {
        Matcher {
            buffer,
            pos: 0,
            captured: Vec::new(),
            error: false,
        }
    }

    /// Asserts `literal` occurs at the cursor and advances past it.
    pub fn check(&mut self, literal: impl AsRef<[u8]>) -> &mut Self {
        if self.error {
            return self;
        }
        let literal = literal.as_ref();
        let end = self.pos + literal.len();
        if end > self.buffer.len() || &self.buffer[self.pos..end] != literal {
            trace!(pos = self.pos, "check failed");
            self.error = true;
            return self;
        }
        self.pos = end;
        self
    }

    /// Captures everything up to the next `end_mark` and advances past it.
    ///
    /// **Input**: `end_mark` (terminator, e.g. `"\r\n"`).
    /// **Output**: `self`, for chaining.
    ///
    /// **Logic**:
    /// 1. Search for `end_mark` from the current position.
    /// 2. Absent: set the sticky error (more bytes may still arrive).
    /// 3. Present: record the slice before the mark, move past the mark.
    pub fn capture(&mut self, end_mark: impl AsRef<[u8]>) -> &mut Self {
        if self.error {
            return self;
        }
        let end_mark = end_mark.as_ref();
        let start = self.pos;
        match find(&self.buffer[start..], end_mark) {
            Some(offset) => {
                let mark_at = start + offset;
                self.captured.push(&self.buffer[start..mark_at]);
                self.pos = mark_at + end_mark.len();
                trace!(pos = self.pos, "captured");
            }
            None => {
                trace!(pos = start, "end mark not found");
                self.error = true;
            }
        }
        self
    }

    /// Skips `delta` bytes unconditionally, subject to bounds checking.
    pub fn forward(&mut self, delta: isize) -> &mut Self {
        if self.error {
            return self;
        }
        match self.pos.checked_add_signed(delta) {
            Some(pos) if pos <= self.buffer.len() => self.pos = pos,
            _ => {
                trace!(pos = self.pos, delta, "forward out of bounds");
                self.error = true;
            }
        }
        self
    }

    /// Runs `body` as many times as the captured value at `captured_index`
    /// declares.
    ///
    /// A non-numeric or negative count runs zero iterations. A missing index
    /// sets the sticky error. The loop stops early once an iteration fails.
    pub fn repeat<F>(&mut self, captured_index: usize, mut body: F) -> &mut Self
    where
        F: FnMut(usize, &mut Matcher<'a>),
    {
        let count = match self.value(captured_index) {
            Some(raw) => parse_count(raw),
            None => 0,
        };
        for index in 0..count {
            if self.error {
                break;
            }
            body(index, self);
        }
        self
    }

    /// Returns the captured value at `index`.
    ///
    /// Asking for a value that was never captured sets the sticky error.
    pub fn value(&mut self, index: usize) -> Option<&'a [u8]> {
        match self.captured.get(index) {
            Some(value) => Some(*value),
            None => {
                self.error = true;
                None
            }
        }
    }

    /// Returns the most recent capture, or `None` once the cursor failed.
    pub fn last(&self) -> Option<&'a [u8]> {
        if self.error {
            return None;
        }
        self.captured.last().copied()
    }

    /// Returns the byte under the cursor without advancing.
    pub fn peek(&self) -> Option<u8> {
        if self.error {
            return None;
        }
        self.buffer.get(self.pos).copied()
    }

    /// Marks the cursor as failed.
    pub fn reject(&mut self) -> &mut Self {
        self.error = true;
        self
    }

    /// Borrowed view of the captured slices.
    pub fn captured(&self) -> &[&'a [u8]] {
        &self.captured
    }

    /// Snapshot of the captured values as strings, in capture order.
    pub fn values(&self) -> Vec<String> {
        self.captured
            .iter()
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Returns the ready length, or `None` if any step failed.
    pub fn evaluate(&self) -> Option<usize> {
        if self.error {
            None
        } else {
            Some(self.pos)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_count(raw: &[u8]) -> usize {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<i64>().ok())
        .map(|count| count.max(0) as usize)
        .unwrap_or(0)
}
