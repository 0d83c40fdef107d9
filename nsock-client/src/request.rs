//! # Requests and Settlement
//!
//! Purpose: Describe one unit of work and the single-assignment slot its
//! outcome is delivered through.
//!
//! ## Design Principles
//! 1. **First Settle Wins**: `Settlement` owns the only sender; settling takes
//!    it, so a late timeout or a late match cannot overwrite a result.
//! 2. **Builder API**: `Request` starts from the payload and adds optional
//!    knobs, keeping call sites short for the common case.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use nsock_match::FulfillRule;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{SendError, SendResult};

/// A request as submitted by the caller.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) payload: Bytes,
    pub(crate) rule: FulfillRule,
    pub(crate) timeout: Option<Duration>,
    pub(crate) urgent: bool,
}

impl Request {
    /// Creates a request whose response is everything received.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Request {
            payload: payload.into(),
            rule: FulfillRule::Remaining,
            timeout: None,
            urgent: false,
        }
    }

    /// Sets the rule deciding when the response is complete.
    pub fn fulfill(mut self, rule: impl Into<FulfillRule>) -> Self {
        self.rule = rule.into();
        self
    }

    /// Fails the request if no response arrives within `timeout`.
    ///
    /// A zero duration means no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Puts the request ahead of everything not yet written.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }
}

impl From<&'static str> for Request {
    fn from(payload: &'static str) -> Self {
        Request::new(payload)
    }
}

impl From<&'static [u8]> for Request {
    fn from(payload: &'static [u8]) -> Self {
        Request::new(payload)
    }
}

impl From<String> for Request {
    fn from(payload: String) -> Self {
        Request::new(payload)
    }
}

impl From<Vec<u8>> for Request {
    fn from(payload: Vec<u8>) -> Self {
        Request::new(payload)
    }
}

impl From<Bytes> for Request {
    fn from(payload: Bytes) -> Self {
        Request::new(payload)
    }
}

/// Single-assignment outcome slot.
#[derive(Debug)]
pub(crate) struct Settlement {
    tx: Option<oneshot::Sender<SendResult<Bytes>>>,
}

impl Settlement {
    pub(crate) fn channel() -> (Settlement, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (Settlement { tx: Some(tx) }, ResponseFuture { rx })
    }

    /// Delivers `outcome` unless something else already did.
    ///
    /// Returns `true` if this call settled the slot.
    pub(crate) fn settle(&mut self, outcome: SendResult<Bytes>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The caller may have dropped its future; the slot still counts
                // as settled.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// True once settled, or once the caller stopped waiting.
    pub(crate) fn is_settled(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Future resolving to the matched response bytes.
#[derive(Debug)]
#[must_use = "the response is only observable by awaiting the future"]
pub struct ResponseFuture {
    rx: oneshot::Receiver<SendResult<Bytes>>,
}

impl Future for ResponseFuture {
    type Output = SendResult<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the connection driver is gone.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(SendError::DeadSocket)))
    }
}

/// A queued request as tracked by the connection driver.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) id: u64,
    pub(crate) payload: Bytes,
    pub(crate) rule: FulfillRule,
    pub(crate) timeout: Option<Duration>,
    pub(crate) settlement: Settlement,
    pub(crate) timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    pub(crate) fn new(id: u64, request: Request, settlement: Settlement) -> Self {
        PendingRequest {
            id,
            payload: request.payload,
            rule: request.rule,
            timeout: request.timeout,
            settlement,
            timer: None,
        }
    }

    /// Settles the outcome and cancels the timeout timer.
    pub(crate) fn finish(&mut self, outcome: SendResult<Bytes>) -> bool {
        self.cancel_timer();
        self.settlement.settle(outcome)
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
