//! # Queued Connection
//!
//! Purpose: Serialize outbound requests over one TCP connection, match the
//! inbound byte stream back to the request waiting at the head of the queue,
//! and reconnect transparently when the peer goes away.
//!
//! ## Design Principles
//! 1. **Actor Pattern**: One driver task owns the state, the queue, the inbound
//!    buffer and the link. Handles talk to it over channels, so every mutation
//!    happens on a single logical thread.
//! 2. **Sequential Matching**: Only the head request is ever matched against
//!    the buffer, and the next request is written only after the head settled.
//! 3. **Self-Healing**: Transport failures are logged and answered with a
//!    reconnect; only timeouts, write failures and `disconnect` fail requests.
//!
//! ## Structure Overview
//!
//! ```text
//! QueuedConnection (cloneable handle)
//!   ├── commands ──────────────► Driver<T: Transport>
//!   └── state (watch)               ├── queue: VecDeque<PendingRequest>
//!                                   ├── buffer: BytesMut (per link)
//!   Link ── LinkNotice{epoch} ─────►├── link: Option<T::Link>
//!   timers ── Timeout / Retry ─────►└── state: ConnectionState
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::SendError;
use crate::request::{PendingRequest, Request, ResponseFuture, Settlement};
use crate::transport::{Link, LinkEvent, LinkEvents, LinkNotice, TcpTransport, Transport};

/// Lifecycle of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        f.write_str(label)
    }
}

/// Passed to the state observer on every transition.
#[derive(Debug, Clone, Copy)]
pub struct StateChange<'a> {
    pub host: &'a str,
    pub port: u16,
    pub state: ConnectionState,
}

type StateObserver = Arc<dyn Fn(&StateChange<'_>) + Send + Sync>;

/// Builder for a `QueuedConnection` with optional observer and transport.
pub struct ConnectionBuilder<T: Transport = TcpTransport> {
    config: ConnectionConfig,
    transport: T,
    observer: Option<StateObserver>,
}

impl ConnectionBuilder<TcpTransport> {
    pub fn new(config: ConnectionConfig) -> Self {
        ConnectionBuilder {
            config,
            transport: TcpTransport,
            observer: None,
        }
    }
}

impl<T: Transport> ConnectionBuilder<T> {
    /// Replaces the transport used for every connect attempt.
    pub fn transport<U: Transport>(self, transport: U) -> ConnectionBuilder<U> {
        ConnectionBuilder {
            config: self.config,
            transport,
            observer: self.observer,
        }
    }

    /// Registers a callback invoked on every connection state transition.
    pub fn on_state_change<F>(mut self, observer: F) -> Self
    where
        F: Fn(&StateChange<'_>) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Spawns the driver task and returns a handle to it.
    ///
    /// Must be called from within a tokio runtime. No connection is opened
    /// until the first `send`.
    pub fn spawn(self) -> QueuedConnection {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let driver = Driver::new(self.config.clone(), self.transport, self.observer, state_tx);
        tokio::spawn(driver.run(commands_rx));
        QueuedConnection {
            commands,
            state: state_rx,
            config: Arc::new(self.config),
        }
    }
}

/// Handle to a resilient, single-connection request queue.
///
/// Cloning the handle shares the same connection. Dropping every handle
/// behaves like `disconnect` and stops the driver.
#[derive(Clone)]
pub struct QueuedConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    config: Arc<ConnectionConfig>,
}

impl fmt::Debug for QueuedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state())
            .finish()
    }
}

impl QueuedConnection {
    /// Spawns a connection over TCP with no state observer.
    pub fn new(config: ConnectionConfig) -> Self {
        ConnectionBuilder::new(config).spawn()
    }

    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(config)
    }

    /// Enqueues a request and returns a future for its response.
    ///
    /// Re-arms automatic reconnection if `disconnect` was called earlier.
    /// The future settles exactly once: with the matched bytes, a timeout,
    /// a write failure, or `DeadSocket`.
    pub fn send(&self, request: impl Into<Request>) -> ResponseFuture {
        let (settlement, response) = Settlement::channel();
        let command = Command::Send {
            request: request.into(),
            settlement,
        };
        if let Err(mpsc::error::SendError(Command::Send { mut settlement, .. })) =
            self.commands.send(command)
        {
            settlement.settle(Err(SendError::DeadSocket));
        }
        response
    }

    /// Tears the connection down and fails every queued request with
    /// `DeadSocket`. Reconnection stays off until the next `send`.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

enum Command {
    Send {
        request: Request,
        settlement: Settlement,
    },
    Disconnect,
}

enum Timer {
    Timeout { id: u64 },
    Retry,
}

struct Driver<T: Transport> {
    config: ConnectionConfig,
    transport: T,
    observer: Option<StateObserver>,
    state_tx: watch::Sender<ConnectionState>,

    state: ConnectionState,
    link: Option<T::Link>,
    // Bumped whenever the link is replaced; stale notices are ignored.
    epoch: u64,
    queue: VecDeque<PendingRequest>,
    buffer: BytesMut,
    // Head request has been written on the current link.
    in_flight: bool,
    alive: bool,
    next_id: u64,
    retry_timer: Option<JoinHandle<()>>,

    notices_tx: mpsc::UnboundedSender<LinkNotice>,
    timers_tx: mpsc::UnboundedSender<Timer>,
    notices_rx: Option<mpsc::UnboundedReceiver<LinkNotice>>,
    timers_rx: Option<mpsc::UnboundedReceiver<Timer>>,
}

impl<T: Transport> Driver<T> {
    fn new(
        config: ConnectionConfig,
        transport: T,
        observer: Option<StateObserver>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        Driver {
            config,
            transport,
            observer,
            state_tx,
            state: ConnectionState::Disconnected,
            link: None,
            epoch: 0,
            queue: VecDeque::new(),
            buffer: BytesMut::new(),
            in_flight: false,
            alive: true,
            next_id: 0,
            retry_timer: None,
            notices_tx,
            timers_tx,
            notices_rx: Some(notices_rx),
            timers_rx: Some(timers_rx),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (Some(mut notices), Some(mut timers)) = (self.notices_rx.take(), self.timers_rx.take())
        else {
            return;
        };
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { request, settlement }) => {
                        self.enqueue(request, settlement)
                    }
                    Some(Command::Disconnect) => self.disconnect(),
                    None => break,
                },
                // The driver holds both senders, so these never yield None.
                Some(notice) = notices.recv() => self.on_notice(notice),
                Some(timer) = timers.recv() => self.on_timer(timer),
            }
        }
        debug!(host = %self.config.host, port = self.config.port, "all handles dropped");
        self.disconnect();
    }

    /// Adds a request to the queue and kicks dispatch when it is alone.
    ///
    /// **Logic**:
    /// 1. Re-arm reconnection.
    /// 2. Arm the timeout timer, if any.
    /// 3. Urgent requests go right behind an in-flight head, else to the front.
    /// 4. Dispatch if this is the only request on a live link, or if the link
    ///    is down with no retry pending.
    fn enqueue(&mut self, request: Request, settlement: Settlement) {
        self.alive = true;
        let urgent = request.urgent;
        let id = self.next_id;
        self.next_id += 1;

        let mut pending = PendingRequest::new(id, request, settlement);
        if let Some(timeout) = pending.timeout {
            pending.timer = Some(self.schedule(timeout, Timer::Timeout { id }));
        }

        if urgent {
            let at = if self.in_flight { 1 } else { 0 };
            self.queue.insert(at.min(self.queue.len()), pending);
        } else {
            self.queue.push_back(pending);
        }
        trace!(id, urgent, queued = self.queue.len(), "request queued");

        let kick = match self.state {
            // A pending retry timer owns the next connect attempt.
            ConnectionState::Disconnected => self.retry_timer.is_none(),
            _ => self.queue.len() == 1,
        };
        if kick {
            self.dispatch();
        }
    }

    /// Writes the head request once connected, connecting first if needed.
    ///
    /// **Logic**:
    /// 1. Not connected: start a connect attempt unless one is in progress.
    /// 2. Drop settled (timed out or abandoned) requests from the head.
    /// 3. Empty queue: stop.
    /// 4. Write the head payload; a failure comes back as `WriteFailed`.
    fn dispatch(&mut self) {
        match self.state {
            ConnectionState::Connected if self.link.is_some() => {}
            ConnectionState::Connecting => return,
            _ => {
                self.connect();
                return;
            }
        }

        while self
            .queue
            .front()
            .is_some_and(|head| head.settlement.is_settled())
        {
            if let Some(mut dropped) = self.queue.pop_front() {
                dropped.cancel_timer();
                trace!(id = dropped.id, "dropped settled request");
            }
        }

        let (Some(head), Some(link)) = (self.queue.front(), self.link.as_mut()) else {
            return;
        };
        trace!(id = head.id, bytes = head.payload.len(), "writing request");
        link.write(head.id, head.payload.clone());
        self.in_flight = true;
    }

    fn connect(&mut self) {
        debug!(host = %self.config.host, port = self.config.port, "start to connect");
        if let Some(mut stale) = self.link.take() {
            stale.destroy();
        }
        self.epoch += 1;
        self.buffer.clear();
        self.in_flight = false;
        self.set_state(ConnectionState::Connecting);
        let events = LinkEvents::new(self.epoch, self.notices_tx.clone());
        let link = self
            .transport
            .connect(&self.config.host, self.config.port, events);
        self.link = Some(link);
    }

    /// Destroys the current link, if any, and moves to Disconnected.
    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            debug!(host = %self.config.host, port = self.config.port, "disconnect");
            link.destroy();
        }
        self.epoch += 1;
        self.buffer.clear();
        self.in_flight = false;
        self.set_state(ConnectionState::Disconnected);
    }

    fn disconnect(&mut self) {
        self.alive = false;
        info!(host = %self.config.host, port = self.config.port, "connection is dead");
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.teardown();
        while let Some(mut pending) = self.queue.pop_front() {
            pending.finish(Err(SendError::DeadSocket));
        }
    }

    /// Drops the link and schedules a reconnect when work is waiting.
    fn retry_to_connect(&mut self) {
        self.teardown();
        if self.queue.is_empty() {
            return;
        }
        let Some(interval) = self.config.retry_interval() else {
            debug!("reconnection disabled");
            return;
        };
        if let Some(previous) = self.retry_timer.take() {
            previous.abort();
        }
        self.retry_timer = Some(self.schedule(interval, Timer::Retry));
    }

    fn on_notice(&mut self, notice: LinkNotice) {
        if notice.epoch != self.epoch {
            trace!(epoch = notice.epoch, current = self.epoch, "ignoring stale link event");
            return;
        }
        match notice.event {
            LinkEvent::Connected => {
                self.set_state(ConnectionState::Connected);
                self.dispatch();
            }
            LinkEvent::Data(chunk) => {
                self.buffer.extend_from_slice(&chunk);
                self.on_data();
            }
            LinkEvent::Error(err) => self.on_error(err),
            LinkEvent::Closed => {
                if self.alive {
                    info!(host = %self.config.host, port = self.config.port, "try to reconnect");
                    self.retry_to_connect();
                } else {
                    self.teardown();
                }
            }
            LinkEvent::WriteFailed { ticket, error } => self.on_write_failed(ticket, error),
        }
    }

    /// Matches the buffer against the head request.
    ///
    /// **Logic**:
    /// 1. No request waiting: log and discard the bytes.
    /// 2. Not ready (`None` or zero length): wait for more bytes.
    /// 3. Ready `len`: settle the head with the first `len` bytes, trim the
    ///    buffer, pop the head and dispatch the next request.
    fn on_data(&mut self) {
        let Some(head) = self.queue.front_mut() else {
            error!(
                bytes = self.buffer.len(),
                data = %String::from_utf8_lossy(&self.buffer),
                "no work but more response"
            );
            self.buffer.clear();
            return;
        };

        let len = match head.rule.ready_len(&self.buffer) {
            Some(len) if len > 0 => len.min(self.buffer.len()),
            _ => return,
        };
        let response = self.buffer.split_to(len).freeze();
        if !head.finish(Ok(response)) {
            trace!(id = head.id, "late response for an already settled request");
        }
        self.queue.pop_front();
        self.in_flight = false;
        self.dispatch();
    }

    fn on_error(&mut self, err: std::io::Error) {
        match self.state {
            ConnectionState::Connecting => {
                // Reconnect is driven by the Closed event that follows.
                warn!(
                    host = %self.config.host,
                    port = self.config.port,
                    error = %err,
                    "cannot connect to the peer"
                );
            }
            ConnectionState::Connected => {
                debug!(error = %err, "transport error, waiting for close");
            }
            ConnectionState::Disconnected => {
                error!(error = %err, "invalid error in disconnected state");
            }
        }
    }

    fn on_write_failed(&mut self, ticket: u64, error: std::io::Error) {
        warn!(id = ticket, error = %error, "write failed");
        if let Some(index) = self.queue.iter().position(|pending| pending.id == ticket) {
            if let Some(mut failed) = self.queue.remove(index) {
                failed.finish(Err(SendError::Write(error)));
            }
        }
        self.retry_to_connect();
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Timeout { id } => {
                let Some(pending) = self.queue.iter_mut().find(|pending| pending.id == id) else {
                    return;
                };
                // Stays queued: an in-flight head still has to absorb its reply.
                pending.timer = None;
                if let Some(timeout) = pending.timeout {
                    debug!(id, ?timeout, "request timed out");
                    pending.settlement.settle(Err(SendError::Timeout(timeout)));
                }
            }
            Timer::Retry => {
                self.retry_timer = None;
                let idle = self.state == ConnectionState::Disconnected;
                if idle && self.alive && !self.queue.is_empty() {
                    self.connect();
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, timer: Timer) -> JoinHandle<()> {
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(timer);
        })
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
        if let Some(observer) = &self.observer {
            observer(&StateChange {
                host: &self.config.host,
                port: self.config.port,
                state,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use bytes::Bytes;
    use nsock_match::FulfillRule;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::transport::scripted::{ScriptedPeer, scripted};

    fn spawn_scripted(retry_ms: i64) -> (QueuedConnection, UnboundedReceiver<ScriptedPeer>) {
        let (transport, attempts) = scripted();
        let config = ConnectionConfig::new("example.test", 4000).with_retry_interval_ms(retry_ms);
        let conn = QueuedConnection::builder(config).transport(transport).spawn();
        (conn, attempts)
    }

    async fn connected_peer(attempts: &mut UnboundedReceiver<ScriptedPeer>) -> ScriptedPeer {
        let peer = attempts.recv().await.expect("connect attempt");
        peer.accept();
        peer
    }

    #[tokio::test]
    async fn fulfills_with_whole_buffer_by_default() {
        let (conn, mut attempts) = spawn_scripted(50);
        let response = conn.send("SET \"k\" \"v\"\r\n");
        let mut peer = connected_peer(&mut attempts).await;
        assert_eq!((peer.host.as_str(), peer.port), ("example.test", 4000));

        let (_, written) = peer.next_write().await;
        assert_eq!(written, Bytes::from_static(b"SET \"k\" \"v\"\r\n"));
        peer.reply(b"+OK\r\n");
        assert_eq!(response.await.unwrap(), Bytes::from_static(b"+OK\r\n"));
    }

    #[tokio::test]
    async fn waits_for_partial_responses() {
        let (conn, mut attempts) = spawn_scripted(50);
        let response = conn.send(Request::new("GET k\r\n").fulfill(FulfillRule::length(11)));
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.reply(b"$5\r\n12");
        peer.reply(b"345\r\n+extra");
        assert_eq!(response.await.unwrap(), Bytes::from_static(b"$5\r\n12345\r\n"));
    }

    #[tokio::test]
    async fn responses_follow_enqueue_order() {
        let (conn, mut attempts) = spawn_scripted(50);
        let first = conn.send(Request::new("A").fulfill(2usize));
        let second = conn.send(Request::new("B").fulfill(2usize));
        let third = conn.send(Request::new("C").fulfill(2usize));
        let mut peer = connected_peer(&mut attempts).await;

        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"A"));
        // Nothing else is written until the head is answered.
        tokio::task::yield_now().await;
        assert!(peer.try_write().is_none());
        peer.reply(b"a\n");

        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"B"));
        peer.reply(b"b\n");
        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"C"));
        peer.reply(b"c\n");

        assert_eq!(first.await.unwrap(), Bytes::from_static(b"a\n"));
        assert_eq!(second.await.unwrap(), Bytes::from_static(b"b\n"));
        assert_eq!(third.await.unwrap(), Bytes::from_static(b"c\n"));
    }

    #[tokio::test]
    async fn urgent_goes_behind_in_flight_head() {
        let (conn, mut attempts) = spawn_scripted(50);
        let first = conn.send(Request::new("A").fulfill(1usize));
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;

        let normal = conn.send(Request::new("B").fulfill(1usize));
        let urgent = conn.send(Request::new("U").fulfill(1usize).urgent());
        tokio::task::yield_now().await;
        peer.reply(b"a");
        assert_eq!(first.await.unwrap(), Bytes::from_static(b"a"));

        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"U"));
        peer.reply(b"u");
        assert_eq!(urgent.await.unwrap(), Bytes::from_static(b"u"));

        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"B"));
        peer.reply(b"b");
        assert_eq!(normal.await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn urgent_jumps_queue_before_connect() {
        let (conn, mut attempts) = spawn_scripted(50);
        let normal = conn.send(Request::new("B").fulfill(1usize));
        let urgent = conn.send(Request::new("U").fulfill(1usize).urgent());
        let mut peer = connected_peer(&mut attempts).await;

        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"U"));
        peer.reply(b"u");
        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"B"));
        peer.reply(b"b");
        assert_eq!(urgent.await.unwrap(), Bytes::from_static(b"u"));
        assert_eq!(normal.await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_pattern_times_out() {
        let (conn, mut attempts) = spawn_scripted(50);
        let rule = FulfillRule::pattern(r"^(\$[0-9]+\r\n[A-Z]+\r\n)$").unwrap();
        let timed = conn.send(
            Request::new("GET k\r\n")
                .fulfill(rule)
                .timeout(Duration::from_millis(100)),
        );
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.reply(b"$5\r\n12345\r\n");

        let err = timed.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("Timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiting_requests_are_skipped() {
        let (conn, mut attempts) = spawn_scripted(50);
        let stale = conn.send(Request::new("OLD").timeout(Duration::from_millis(10)));
        let fresh = conn.send(Request::new("NEW"));
        let attempt = attempts.recv().await.expect("connect attempt");

        assert!(stale.await.unwrap_err().is_timeout());
        let mut peer = attempt;
        peer.accept();
        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"NEW"));
        peer.reply(b"ok");
        assert_eq!(fresh.await.unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_close_and_rewrites_head() {
        let (conn, mut attempts) = spawn_scripted(50);
        let response = conn.send("PING\r\n");
        let mut first = connected_peer(&mut attempts).await;
        first.next_write().await;
        first.close();

        let mut second = connected_peer(&mut attempts).await;
        assert!(first.is_destroyed());
        let (_, payload) = second.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"PING\r\n"));
        second.reply(b"+PONG\r\n");
        assert_eq!(response.await.unwrap(), Bytes::from_static(b"+PONG\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_to_timed_out_head_is_absorbed() {
        let (conn, mut attempts) = spawn_scripted(50);
        let slow = conn.send(
            Request::new("A")
                .fulfill(1usize)
                .timeout(Duration::from_millis(100)),
        );
        let next = conn.send(Request::new("B").fulfill(1usize));
        let mut peer = connected_peer(&mut attempts).await;
        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"A"));

        assert!(slow.await.unwrap_err().is_timeout());
        // The timed-out head still owns the link until its reply shows up.
        assert!(peer.try_write().is_none());
        peer.reply(b"a");

        let (_, payload) = peer.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"B"));
        peer.reply(b"b");
        assert_eq!(next.await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_bytes_do_not_survive_reconnect() {
        let (conn, mut attempts) = spawn_scripted(50);
        let response = conn.send(Request::new("GET k\r\n").fulfill(3usize));
        let mut first = connected_peer(&mut attempts).await;
        first.next_write().await;
        first.reply(b"xy");
        first.close();

        let mut second = connected_peer(&mut attempts).await;
        second.next_write().await;
        second.reply(b"abc");
        assert_eq!(response.await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_during_backoff_wait_for_retry_timer() {
        let (conn, mut attempts) = spawn_scripted(1_000);
        let first = conn.send(Request::new("A").fulfill(1usize));
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.close();

        let second = conn.send(Request::new("B").fulfill(1usize));
        let third = conn.send(Request::new("C").fulfill(1usize));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempts.try_recv().is_err());

        let waiting = tokio::time::Instant::now();
        let mut retry = connected_peer(&mut attempts).await;
        assert!(waiting.elapsed() >= Duration::from_millis(800));
        for (sent, reply) in [("A", "a"), ("B", "b"), ("C", "c")] {
            let (_, payload) = retry.next_write().await;
            assert_eq!(payload, Bytes::from(sent));
            retry.reply(reply.as_bytes());
        }
        assert_eq!(first.await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(second.await.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(third.await.unwrap(), Bytes::from_static(b"c"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_error_defers_to_close() {
        let (conn, mut attempts) = spawn_scripted(50);
        let response = conn.send(Request::new("PING\r\n").timeout(Duration::from_secs(1)));

        let refused = attempts.recv().await.expect("first attempt");
        refused.fail(io::ErrorKind::ConnectionRefused);
        refused.close();

        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.reply(b"+PONG\r\n");
        assert_eq!(response.await.unwrap(), Bytes::from_static(b"+PONG\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_fails_only_that_request() {
        let (conn, mut attempts) = spawn_scripted(50);
        let broken = conn.send("A");
        let next = conn.send("B");
        let mut peer = connected_peer(&mut attempts).await;
        let (ticket, _) = peer.next_write().await;
        peer.fail_write(ticket);

        assert!(matches!(broken.await, Err(SendError::Write(_))));
        let mut replacement = connected_peer(&mut attempts).await;
        let (_, payload) = replacement.next_write().await;
        assert_eq!(payload, Bytes::from_static(b"B"));
        replacement.reply(b"b");
        assert_eq!(next.await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn disconnect_rejects_everything_queued() {
        let (conn, mut attempts) = spawn_scripted(-1);
        let first = conn.send("SHOULD FAIL");
        let second = conn.send("NEVER SENT");
        conn.disconnect();

        assert!(first.await.unwrap_err().is_dead_socket());
        assert!(second.await.unwrap_err().is_dead_socket());
        let attempt = attempts.recv().await.expect("connect attempt");
        assert!(attempt.is_destroyed());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_after_disconnect_reconnects() {
        let (conn, mut attempts) = spawn_scripted(-1);
        let dead = conn.send("A");
        conn.disconnect();
        assert!(dead.await.unwrap_err().is_dead_socket());
        attempts.recv().await.expect("first attempt");

        let response = conn.send("B");
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.reply(b"b");
        assert_eq!(response.await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_interval_makes_close_terminal() {
        let (conn, mut attempts) = spawn_scripted(-1);
        let response = conn.send(Request::new("A").timeout(Duration::from_millis(500)));
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.close();

        assert!(response.await.unwrap_err().is_timeout());
        assert!(attempts.try_recv().is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unexpected_data_is_discarded() {
        let (conn, mut attempts) = spawn_scripted(50);
        let first = conn.send(Request::new("A").fulfill(1usize));
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.reply(b"a");
        assert_eq!(first.await.unwrap(), Bytes::from_static(b"a"));

        peer.reply(b"garbage");
        tokio::task::yield_now().await;
        let second = conn.send(Request::new("B").fulfill(1usize));
        peer.next_write().await;
        peer.reply(b"b");
        assert_eq!(second.await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn observer_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (transport, mut attempts) = scripted();
        let conn = QueuedConnection::builder(ConnectionConfig::new("example.test", 1))
            .transport(transport)
            .on_state_change(move |change| sink.lock().unwrap().push(change.state))
            .spawn();

        let response = conn.send("A");
        let mut peer = connected_peer(&mut attempts).await;
        peer.next_write().await;
        peer.reply(b"a");
        response.await.unwrap();
        let pending = conn.send("B");
        conn.disconnect();
        assert!(pending.await.unwrap_err().is_dead_socket());

        assert_eq!(*conn.subscribe_state().borrow(), ConnectionState::Disconnected);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn dropping_handles_fails_pending_requests() {
        let (conn, mut attempts) = spawn_scripted(50);
        let response = conn.send("A");
        let _peer = attempts.recv().await.expect("connect attempt");
        drop(conn);
        assert!(response.await.unwrap_err().is_dead_socket());
    }
}
