//! # TCP Transport
//!
//! Purpose: Drive one `tokio::net::TcpStream` per link and translate socket
//! activity into `LinkEvent`s.
//!
//! ## Design Principles
//! 1. **One Task per Link**: Connect, reads and writes run in a single spawned
//!    task; `destroy` aborts it, which closes the socket.
//! 2. **Full Duplex**: The read and write loops are polled side by side, so a
//!    large request never stops the link from draining the reply.
//! 3. **Low Latency**: Nagle is disabled, requests are small and sequential.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Link, LinkEvent, LinkEvents, Transport};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default transport connecting over plain TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Link = TcpLink;

    fn connect(&mut self, host: &str, port: u16, events: LinkEvents) -> TcpLink {
        let (writes, writes_rx) = mpsc::unbounded_channel();
        let addr = format!("{host}:{port}");
        let task = tokio::spawn(drive_link(addr, writes_rx, events));
        TcpLink {
            writes,
            task: Some(task),
        }
    }
}

/// Handle to a link driven by `TcpTransport`.
#[derive(Debug)]
pub struct TcpLink {
    writes: mpsc::UnboundedSender<(u64, Bytes)>,
    task: Option<JoinHandle<()>>,
}

impl Link for TcpLink {
    fn write(&mut self, ticket: u64, payload: Bytes) {
        // A closed channel means the task already ended; its Closed event is
        // on the way and drives recovery.
        let _ = self.writes.send((ticket, payload));
    }

    fn destroy(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn drive_link(
    addr: String,
    mut writes: mpsc::UnboundedReceiver<(u64, Bytes)>,
    events: LinkEvents,
) {
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%addr, epoch = events.epoch(), error = %err, "connect failed");
            events.emit(LinkEvent::Error(err));
            events.emit(LinkEvent::Closed);
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%addr, error = %err, "failed to disable nagle");
    }
    if !events.emit(LinkEvent::Connected) {
        return;
    }

    let (reader, writer) = stream.split();
    tokio::select! {
        () = read_loop(reader, &addr, &events) => {}
        () = write_loop(writer, &mut writes, &events) => {}
    }
}

/// Forwards inbound chunks until EOF, a read error, or the driver going away.
async fn read_loop(mut reader: ReadHalf<'_>, addr: &str, events: &LinkEvents) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buffer.reserve(READ_BUFFER_SIZE);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!(%addr, "peer closed the connection");
                events.emit(LinkEvent::Closed);
                return;
            }
            Ok(_) => {
                if !events.emit(LinkEvent::Data(buffer.split().freeze())) {
                    return;
                }
            }
            Err(err) => {
                events.emit(LinkEvent::Error(err));
                events.emit(LinkEvent::Closed);
                return;
            }
        }
    }
}

/// Writes queued payloads in order until the link handle is dropped.
async fn write_loop(
    mut writer: WriteHalf<'_>,
    writes: &mut mpsc::UnboundedReceiver<(u64, Bytes)>,
    events: &LinkEvents,
) {
    while let Some((ticket, payload)) = writes.recv().await {
        if let Err(error) = writer.write_all(&payload).await {
            events.emit(LinkEvent::WriteFailed { ticket, error });
        }
    }
}
