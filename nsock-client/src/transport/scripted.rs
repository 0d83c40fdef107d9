//! Scripted transport for driving the connection state machine in tests.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Link, LinkEvent, LinkEvents, Transport};

/// Transport that hands every connect attempt to the test as a `ScriptedPeer`.
pub(crate) struct ScriptedTransport {
    attempts: mpsc::UnboundedSender<ScriptedPeer>,
}

/// Creates a transport plus the stream of connect attempts it will receive.
pub(crate) fn scripted() -> (ScriptedTransport, mpsc::UnboundedReceiver<ScriptedPeer>) {
    let (attempts, rx) = mpsc::unbounded_channel();
    (ScriptedTransport { attempts }, rx)
}

impl Transport for ScriptedTransport {
    type Link = ScriptedLink;

    fn connect(&mut self, host: &str, port: u16, events: LinkEvents) -> ScriptedLink {
        let (writes, writes_rx) = mpsc::unbounded_channel();
        let destroyed = Arc::new(AtomicBool::new(false));
        let _ = self.attempts.send(ScriptedPeer {
            host: host.to_string(),
            port,
            events,
            writes: writes_rx,
            destroyed: destroyed.clone(),
        });
        ScriptedLink { writes, destroyed }
    }
}

pub(crate) struct ScriptedLink {
    writes: mpsc::UnboundedSender<(u64, Bytes)>,
    destroyed: Arc<AtomicBool>,
}

impl Link for ScriptedLink {
    fn write(&mut self, ticket: u64, payload: Bytes) {
        let _ = self.writes.send((ticket, payload));
    }

    fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Remote end of one connect attempt, controlled by the test.
pub(crate) struct ScriptedPeer {
    pub(crate) host: String,
    pub(crate) port: u16,
    events: LinkEvents,
    writes: mpsc::UnboundedReceiver<(u64, Bytes)>,
    destroyed: Arc<AtomicBool>,
}

impl ScriptedPeer {
    pub(crate) fn accept(&self) {
        self.events.emit(LinkEvent::Connected);
    }

    pub(crate) fn reply(&self, data: &'static [u8]) {
        self.events.emit(LinkEvent::Data(Bytes::from_static(data)));
    }

    pub(crate) fn fail(&self, kind: io::ErrorKind) {
        self.events.emit(LinkEvent::Error(io::Error::from(kind)));
    }

    pub(crate) fn close(&self) {
        self.events.emit(LinkEvent::Closed);
    }

    pub(crate) fn fail_write(&self, ticket: u64) {
        self.events.emit(LinkEvent::WriteFailed {
            ticket,
            error: io::Error::from(io::ErrorKind::BrokenPipe),
        });
    }

    /// Waits for the next payload the connection writes on this link.
    pub(crate) async fn next_write(&mut self) -> (u64, Bytes) {
        self.writes.recv().await.expect("link dropped before writing")
    }

    /// Returns a payload already written, without waiting.
    pub(crate) fn try_write(&mut self) -> Option<(u64, Bytes)> {
        self.writes.try_recv().ok()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
