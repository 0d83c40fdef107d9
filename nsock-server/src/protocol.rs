//! # Command Parsing
//!
//! Purpose: Extract client commands from a growing read buffer, accepting both
//! the inline format (`SET "k" "v"\r\n`) and RESP2 arrays of bulk strings.
//!
//! ## Design Principles
//! 1. **Peek, Then Consume**: A command is only removed from the buffer once it
//!    is complete; partial input is left untouched.
//! 2. **Fail Fast**: Malformed framing returns `ParseError::Protocol` and the
//!    connection is answered with an error and closed.

use std::fmt;

use bytes::{Buf, BytesMut};

/// Longest inline line accepted before the peer is considered broken.
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// Framing error raised by `CommandParser`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed framing or an oversized inline line.
    Protocol,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Protocol => write!(f, "protocol error"),
        }
    }
}

impl std::error::Error for ParseError {}

type Parsed = Option<(Vec<Vec<u8>>, usize)>;

/// Incremental command parser.
#[derive(Debug, Clone)]
pub struct CommandParser {
    max_inline_len: usize,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    pub fn new() -> Self {
        CommandParser {
            max_inline_len: MAX_INLINE_LEN,
        }
    }

    /// Parses the next complete command out of `buffer`.
    ///
    /// **Input**: buffer holding everything read so far.
    /// **Output**: `Ok(Some(args))` and the command consumed, `Ok(None)` when
    /// more bytes are needed, or a protocol error.
    ///
    /// **Logic**:
    /// 1. `*` selects RESP2 array framing, anything else is an inline line.
    /// 2. Blank inline lines are consumed and skipped.
    pub fn parse(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, ParseError> {
        loop {
            if buffer.is_empty() {
                return Ok(None);
            }
            let parsed = if buffer[0] == b'*' {
                parse_array(buffer)?
            } else {
                self.parse_inline(buffer)?
            };
            let Some((args, consumed)) = parsed else {
                return Ok(None);
            };
            buffer.advance(consumed);
            if !args.is_empty() {
                return Ok(Some(args));
            }
        }
    }

    fn parse_inline(&self, buffer: &[u8]) -> Result<Parsed, ParseError> {
        let Some(newline) = buffer.iter().position(|b| *b == b'\n') else {
            if buffer.len() > self.max_inline_len {
                return Err(ParseError::Protocol);
            }
            return Ok(None);
        };
        let line = match buffer[..newline].strip_suffix(b"\r") {
            Some(line) => line,
            None => &buffer[..newline],
        };
        Ok(Some((tokenize(line)?, newline + 1)))
    }
}

fn tokenize(line: &[u8]) -> Result<Vec<Vec<u8>>, ParseError> {
    let mut args = Vec::new();
    let mut idx = 0;
    while idx < line.len() {
        match line[idx] {
            b' ' | b'\t' => idx += 1,
            b'"' => {
                idx += 1;
                let mut token = Vec::new();
                let mut closed = false;
                while idx < line.len() {
                    match line[idx] {
                        b'\\' if idx + 1 < line.len() => {
                            token.push(line[idx + 1]);
                            idx += 2;
                        }
                        b'"' => {
                            closed = true;
                            idx += 1;
                            break;
                        }
                        b => {
                            token.push(b);
                            idx += 1;
                        }
                    }
                }
                if !closed {
                    return Err(ParseError::Protocol);
                }
                args.push(token);
            }
            _ => {
                let start = idx;
                while idx < line.len() && !matches!(line[idx], b' ' | b'\t') {
                    idx += 1;
                }
                args.push(line[start..idx].to_vec());
            }
        }
    }
    Ok(args)
}

fn parse_array(buffer: &[u8]) -> Result<Parsed, ParseError> {
    let Some((count, mut pos)) = read_header(buffer, 0, b'*')? else {
        return Ok(None);
    };
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let Some((len, start)) = read_header(buffer, pos, b'$')? else {
            return Ok(None);
        };
        let Some(end) = start.checked_add(len).filter(|end| *end < usize::MAX - 1) else {
            return Err(ParseError::Protocol);
        };
        if buffer.len() < end + 2 {
            return Ok(None);
        }
        if &buffer[end..end + 2] != b"\r\n" {
            return Err(ParseError::Protocol);
        }
        args.push(buffer[start..end].to_vec());
        pos = end + 2;
    }
    Ok(Some((args, pos)))
}

/// Reads a `<prefix><digits>\r\n` header at `pos`, returning the value and the
/// offset just past the header.
fn read_header(
    buffer: &[u8],
    pos: usize,
    prefix: u8,
) -> Result<Option<(usize, usize)>, ParseError> {
    let Some(&first) = buffer.get(pos) else {
        return Ok(None);
    };
    if first != prefix {
        return Err(ParseError::Protocol);
    }
    let Some(offset) = buffer[pos..].windows(2).position(|w| w == b"\r\n") else {
        return Ok(None);
    };
    let digits = &buffer[pos + 1..pos + offset];
    Ok(Some((parse_usize(digits)?, pos + offset + 2)))
}

fn parse_usize(data: &[u8]) -> Result<usize, ParseError> {
    if data.is_empty() {
        return Err(ParseError::Protocol);
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(ParseError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}
