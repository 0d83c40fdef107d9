//! # RESP2 Helpers
//!
//! Purpose: Build Redis-style requests and recognise one complete RESP2 reply
//! in the inbound buffer, for callers talking to Redis-compatible peers.
//!
//! ## Design Principles
//! 1. **Rules, Not Parsers**: `reply_rule` only measures a reply; decoding it
//!    is left to the caller, who gets the exact reply bytes back.
//! 2. **Binary-Safe**: Bulk strings are skipped by their declared length, so
//!    payloads containing CRLF are measured correctly.

use nsock_match::{FulfillRule, Matcher};

const CRLF: &str = "\r\n";

/// Encodes a RESP2 array command into `out`.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(CRLF.as_bytes());
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(CRLF.as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF.as_bytes());
    }
}

/// Encodes commands in the inline format, one CRLF-terminated line each.
///
/// The first token of every command is written bare, the rest double quoted:
/// `[["SET", "k", "v"]]` becomes `SET "k" "v"\r\n`.
pub fn encode_inline(commands: &[&[&str]]) -> String {
    let mut out = String::new();
    for command in commands {
        for (index, token) in command.iter().enumerate() {
            if index > 0 {
                out.push(' ');
                out.push('"');
                for ch in token.chars() {
                    if ch == '"' || ch == '\\' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push('"');
            } else {
                out.push_str(token);
            }
        }
        out.push_str(CRLF);
    }
    out
}

/// Rule accepting exactly one RESP2 reply of any type, nested arrays included.
pub fn reply_rule() -> FulfillRule {
    FulfillRule::scan(scan_reply)
}

/// Rule accepting `count` consecutive RESP2 replies, e.g. for a batch of
/// inline commands written in one request.
pub fn replies_rule(count: usize) -> FulfillRule {
    FulfillRule::scan(move |m| {
        for _ in 0..count {
            scan_reply(m);
        }
    })
}

/// Advances `m` over one reply.
///
/// **Logic**:
/// 1. `+`, `-`, `:` replies end at the first CRLF.
/// 2. `$n` skips `n` bytes plus CRLF; `$-1` is a null bulk string.
/// 3. `*n` adds `n` elements to the count still owed; `*-1` is a null array.
/// 4. Any other type byte fails the scan.
///
/// Nesting is tracked with a counter, so peer-controlled depth never grows
/// the call stack.
pub fn scan_reply(m: &mut Matcher<'_>) {
    // Elements still owed by the reply and every open array.
    let mut owed: u64 = 1;
    while owed > 0 && !m.is_error() {
        owed -= 1;
        match m.peek() {
            Some(b'+' | b'-' | b':') => {
                m.forward(1).capture(CRLF);
            }
            Some(b'$') => {
                m.check("$").capture(CRLF);
                if m.is_error() {
                    return;
                }
                match m.last().and_then(parse_len) {
                    Some(len) if len >= 0 => {
                        m.forward(len as isize).check(CRLF);
                    }
                    Some(_) => {}
                    None => {
                        m.reject();
                    }
                }
            }
            Some(b'*') => {
                m.check("*").capture(CRLF);
                if m.is_error() {
                    return;
                }
                match m.last().and_then(parse_len) {
                    Some(count) if count > 0 => owed = owed.saturating_add(count as u64),
                    Some(_) => {}
                    None => {
                        m.reject();
                    }
                }
            }
            _ => {
                m.reject();
            }
        }
    }
}

fn parse_len(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
