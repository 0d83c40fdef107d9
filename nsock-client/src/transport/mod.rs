//! # Transport Contract
//!
//! Purpose: Separate the connection state machine from the byte stream it
//! drives, so the state machine can be exercised without real sockets.
//!
//! ## Design Principles
//! 1. **Commands In, Events Out**: The connection calls `connect`, `write` and
//!    `destroy`; the link reports back through `LinkEvents` only.
//! 2. **Epoch Tagging**: Every event carries the epoch of the link that
//!    produced it, so late events from a destroyed link are recognisable.
//! 3. **Non-Blocking**: No method waits on the network; results arrive later
//!    as events.

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

mod tcp;

#[cfg(test)]
pub(crate) mod scripted;

pub use tcp::{TcpLink, TcpTransport};

/// Notification raised by a link.
#[derive(Debug)]
pub enum LinkEvent {
    /// The connection attempt succeeded.
    Connected,
    /// A chunk of inbound bytes.
    Data(Bytes),
    /// A transport-level failure; a `Closed` event follows.
    Error(io::Error),
    /// The link is gone, either after a failure or an orderly shutdown.
    Closed,
    /// Writing the payload tagged `ticket` failed.
    WriteFailed { ticket: u64, error: io::Error },
}

/// Envelope delivered to the connection driver.
#[derive(Debug)]
pub(crate) struct LinkNotice {
    pub(crate) epoch: u64,
    pub(crate) event: LinkEvent,
}

/// Sink a link uses to report events back to its connection.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<LinkNotice>,
}

impl LinkEvents {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<LinkNotice>) -> Self {
        LinkEvents { epoch, tx }
    }

    /// Reports `event`. Returns `false` once the connection has shut down.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkNotice {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Factory for links to a remote peer.
pub trait Transport: Send + 'static {
    type Link: Link;

    /// Starts a connection attempt to `host:port`.
    ///
    /// Returns immediately; the outcome is reported through `events`
    /// (`Connected`, or `Error` followed by `Closed`).
    fn connect(&mut self, host: &str, port: u16, events: LinkEvents) -> Self::Link;
}

/// One live (or pending) byte stream.
pub trait Link: Send + 'static {
    /// Queues `payload` for writing. Failures come back as `WriteFailed`.
    fn write(&mut self, ticket: u64, payload: Bytes);

    /// Tears the link down. No further events are expected to matter.
    fn destroy(&mut self);
}
