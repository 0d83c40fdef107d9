//! # nsock Client
//!
//! Purpose: Provide a resilient, single-connection TCP client that queues
//! requests, matches each inbound response to the request waiting for it, and
//! reconnects on its own when the peer goes away.
//!
//! ## Design Principles
//! 1. **One Connection, One Queue**: Requests are answered strictly in the
//!    order they were issued; nothing is pipelined.
//! 2. **Caller-Defined Framing**: A `FulfillRule` decides where each response
//!    ends, so any line- or length-delimited text protocol fits.
//! 3. **Pluggable Transport**: The state machine only sees the `Transport` and
//!    `Link` traits; `TcpTransport` is the default.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use nsock_client::{ConnectionConfig, QueuedConnection, Request, resp};
//!
//! # async fn demo() -> Result<(), nsock_client::SendError> {
//! let conn = QueuedConnection::new(ConnectionConfig::new("127.0.0.1", 6379));
//! let reply = conn
//!     .send(
//!         Request::new("GET \"key\"\r\n")
//!             .fulfill(resp::reply_rule())
//!             .timeout(Duration::from_secs(1)),
//!     )
//!     .await?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! conn.disconnect();
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
mod request;
pub mod resp;
pub mod transport;

pub use config::{ConnectionConfig, DEFAULT_RETRY_INTERVAL_MS};
pub use connection::{ConnectionBuilder, ConnectionState, QueuedConnection, StateChange};
pub use error::{ConfigError, ConfigResult, SendError, SendResult};
pub use nsock_match::{FulfillRule, MatchError, Matcher, Scan};
pub use request::{Request, ResponseFuture};
