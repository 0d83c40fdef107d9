//! # nsock Reference Responder
//!
//! Purpose: A small TCP peer for exercising queued connections: either an
//! echo server or a Redis-compatible in-memory key/value responder.
//!
//! ## Design Principles
//! 1. **Task per Connection**: Each accepted socket runs its own read loop.
//! 2. **Incremental Parsing**: Commands are parsed out of a growing
//!    `BytesMut`; partial commands wait for more bytes.
//! 3. **Batched Replies**: Replies for every command parsed from one read are
//!    written with a single `write_all`.

mod protocol;
mod server;

pub use protocol::{CommandParser, ParseError};
pub use server::{handle_connection, ResponderMode, Server, ServerConfig, Store};
