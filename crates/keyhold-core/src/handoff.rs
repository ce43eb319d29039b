#![forbid(unsafe_code)]

//! Ordered, lossless handoff from the capture thread to the consumer.
//!
//! A thin wrapper over [`std::sync::mpsc`]: unbounded, FIFO, and never drops
//! a message. Each message travels in an envelope carrying a sequence
//! number assigned by the sender, which the receiver checks for contiguity
//! in debug builds.
//!
//! # Invariants
//!
//! - Messages are received in exactly the order they were sent.
//! - A message is received at most once.
//! - Sending after the receiver is gone fails with [`HandoffClosed`]; the
//!   capture loop treats that as its signal to stop.

use std::sync::mpsc;
use std::time::Duration;

use crate::capture::DelayWarning;
use crate::error::{CloseReason, HandoffClosed};
use crate::input::InputBatch;

/// A message from the capture thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMessage {
    /// Capture started; the host stream is configured.
    Ready,
    /// Units captured within one coalescing window.
    Batch(InputBatch),
    /// Arrival gap at the capture boundary exceeded the warning threshold.
    DelayWarning(DelayWarning),
    /// Capture terminated. Always the last message.
    Closed(CloseReason),
}

impl CaptureMessage {
    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Batch(_) => "batch",
            Self::DelayWarning(_) => "delay_warning",
            Self::Closed(_) => "closed",
        }
    }
}

#[derive(Debug)]
struct Envelope {
    seq: u64,
    msg: CaptureMessage,
}

/// Create a connected sender/receiver pair.
#[must_use]
pub fn channel() -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel();
    (
        HandoffSender { tx, next_seq: 0 },
        HandoffReceiver {
            rx,
            expected_seq: 0,
        },
    )
}

/// Capture-side end of the handoff.
#[derive(Debug)]
pub struct HandoffSender {
    tx: mpsc::Sender<Envelope>,
    next_seq: u64,
}

impl HandoffSender {
    /// Send a message to the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffClosed`] if the receiver has been dropped.
    pub fn send(&mut self, msg: CaptureMessage) -> Result<(), HandoffClosed> {
        let seq = self.next_seq;
        self.tx
            .send(Envelope { seq, msg })
            .map_err(|_| HandoffClosed)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Number of messages sent so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.next_seq
    }
}

/// Consumer-side end of the handoff.
#[derive(Debug)]
pub struct HandoffReceiver {
    rx: mpsc::Receiver<Envelope>,
    expected_seq: u64,
}

impl HandoffReceiver {
    /// Block until a message arrives.
    ///
    /// Returns `None` once the sender is gone and the channel is drained.
    pub fn recv(&mut self) -> Option<CaptureMessage> {
        self.rx.recv().ok().map(|env| self.accept(env))
    }

    /// Wait up to `timeout` for a message.
    ///
    /// Returns `Err(RecvTimeoutError::Disconnected)` once the sender is gone
    /// and the channel is drained.
    pub fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<CaptureMessage, mpsc::RecvTimeoutError> {
        let env = self.rx.recv_timeout(timeout)?;
        Ok(self.accept(env))
    }

    /// Take a message if one is immediately available.
    pub fn try_recv(&mut self) -> Result<CaptureMessage, mpsc::TryRecvError> {
        let env = self.rx.try_recv()?;
        Ok(self.accept(env))
    }

    /// Number of messages received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.expected_seq
    }

    fn accept(&mut self, env: Envelope) -> CaptureMessage {
        debug_assert_eq!(
            env.seq, self.expected_seq,
            "handoff message out of order"
        );
        self.expected_seq = env.seq + 1;
        env.msg
    }
}
