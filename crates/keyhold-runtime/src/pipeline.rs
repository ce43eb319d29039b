#![forbid(unsafe_code)]

//! Consumer-side driver: handoff channel → input buffer → render scheduler.
//!
//! The [`Pipeline`] is what the application's main loop calls. Each
//! [`pump`](Pipeline::pump) fires due timers, waits for capture messages no
//! longer than the earliest pending timer deadline, and applies what
//! arrived: batches go into the [`InputBuffer`] and mark input on the
//! [`RenderScheduler`]. Timers therefore fire on time as long as the
//! application keeps pumping, with no OS timers involved.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use keyhold_core::config::PipelineConfig;
//! use keyhold_runtime::pipeline::Pipeline;
//! use keyhold_runtime::render_scheduler::RenderPriority;
//!
//! let mut pipeline: Pipeline = Pipeline::spawn_stdin(PipelineConfig::from_env()?)?;
//! while !pipeline.is_closed() {
//!     let report = pipeline.pump(Duration::from_millis(16))?;
//!     if report.batches > 0 {
//!         let input = pipeline.buffer_mut().flush();
//!         let echo = input.text().into_owned();
//!         pipeline.request_render(move || { print!("{echo}"); Ok(()) }, RenderPriority::High)?;
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io::{self, Read};
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use keyhold_core::config::PipelineConfig;
use keyhold_core::error::{CloseReason, ConfigError};
use keyhold_core::handoff::{CaptureMessage, HandoffReceiver};
use keyhold_core::timer;

use crate::capture_thread::{self, CaptureHandle, SpawnError};
use crate::debug_trace;
use crate::input_buffer::{BufferHooks, InputBuffer};
use crate::render_scheduler::{RenderOutcome, RenderPriority, RenderScheduler};

/// What one pump applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Capture messages received.
    pub messages: usize,
    /// Batches pushed into the buffer.
    pub batches: usize,
    /// Units in those batches.
    pub units: usize,
    /// Delay warnings received from capture.
    pub delay_warnings: usize,
    /// Deferred renders executed by timers.
    pub deferred_flushed: usize,
    /// Set when capture reported that it terminated.
    pub closed: Option<CloseReason>,
}

impl PumpReport {
    fn absorb(&mut self, other: PumpReport) {
        self.messages += other.messages;
        self.batches += other.batches;
        self.units += other.units;
        self.delay_warnings += other.delay_warnings;
        self.deferred_flushed += other.deferred_flushed;
        if other.closed.is_some() {
            self.closed = other.closed;
        }
    }
}

/// The consumer side of a capture pipeline.
#[derive(Debug)]
pub struct Pipeline<E = io::Error> {
    receiver: HandoffReceiver,
    disconnected: bool,
    buffer: InputBuffer,
    scheduler: RenderScheduler<E>,
    capture: Option<CaptureHandle>,
    ready: bool,
    closed: Option<CloseReason>,
    delay_warnings: u64,
}

impl<E> Pipeline<E> {
    /// Attach to an existing handoff receiver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the buffer or scheduler config is invalid.
    pub fn new(receiver: HandoffReceiver, config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            receiver,
            disconnected: false,
            buffer: InputBuffer::new(config.buffer.clone())?,
            scheduler: RenderScheduler::new(config.scheduler.clone())?,
            capture: None,
            ready: false,
            closed: None,
            delay_warnings: 0,
        })
    }

    /// Start capturing from `reader` and attach to it.
    ///
    /// # Errors
    ///
    /// Fails if any part of the config is invalid or capture cannot start.
    pub fn spawn<R>(reader: R, config: PipelineConfig) -> Result<Self, SpawnError>
    where
        R: Read + Send + 'static,
    {
        // Validate the consumer side before any thread or raw mode exists.
        config.validate()?;
        let (handle, receiver) = capture_thread::spawn_capture(reader, config.capture.clone())?;
        let mut pipeline = Self::new(receiver, &config)?;
        pipeline.capture = Some(handle);
        Ok(pipeline)
    }

    /// Start capturing from standard input and attach to it.
    ///
    /// # Errors
    ///
    /// See [`spawn`](Self::spawn).
    pub fn spawn_stdin(config: PipelineConfig) -> Result<Self, SpawnError> {
        Self::spawn(io::stdin(), config)
    }

    /// Attach observer hooks to the input buffer.
    #[must_use]
    pub fn with_buffer_hooks(mut self, hooks: BufferHooks) -> Self {
        self.buffer.set_hooks(hooks);
        self
    }

    // -- components --------------------------------------------------------

    /// The input buffer.
    #[must_use]
    pub fn buffer(&self) -> &InputBuffer {
        &self.buffer
    }

    /// The input buffer, for flushing.
    pub fn buffer_mut(&mut self) -> &mut InputBuffer {
        &mut self.buffer
    }

    /// The render scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &RenderScheduler<E> {
        &self.scheduler
    }

    /// The render scheduler, for requests and manual flushes.
    pub fn scheduler_mut(&mut self) -> &mut RenderScheduler<E> {
        &mut self.scheduler
    }

    /// Shorthand for [`RenderScheduler::request_render`].
    ///
    /// # Errors
    ///
    /// Returns the work item's error if it ran and failed.
    pub fn request_render<F>(&mut self, work: F, priority: RenderPriority) -> Result<RenderOutcome, E>
    where
        F: FnOnce() -> Result<(), E> + 'static,
    {
        self.scheduler.request_render(work, priority)
    }

    // -- state -------------------------------------------------------------

    /// Whether capture has reported `Ready`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether capture has reported `Closed`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Why capture terminated, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.as_ref()
    }

    /// Delay warnings received from capture so far.
    #[must_use]
    pub fn delay_warnings(&self) -> u64 {
        self.delay_warnings
    }

    /// Earliest pending timer deadline across buffer and scheduler.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        timer::earliest(self.buffer.next_deadline(), self.scheduler.next_deadline())
    }

    // -- pumping -----------------------------------------------------------

    /// Pump for at most `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns a render error from a timer-driven deferred flush.
    pub fn pump(&mut self, max_wait: Duration) -> Result<PumpReport, E> {
        self.pump_until(Instant::now() + max_wait)
    }

    /// Pump until input arrives, capture closes, or `deadline` passes.
    ///
    /// Due timers fire on every iteration. Returns as soon as at least one
    /// batch (or the close notice) has been applied.
    ///
    /// # Errors
    ///
    /// Returns a render error from a timer-driven deferred flush.
    pub fn pump_until(&mut self, deadline: Instant) -> Result<PumpReport, E> {
        let mut report = PumpReport::default();
        loop {
            let now = Instant::now();
            report.deferred_flushed += self.fire_timers(now)?;
            self.drain_available(&mut report);
            if report.batches > 0 || report.closed.is_some() || now >= deadline {
                return Ok(report);
            }

            let wake = timer::earliest(Some(deadline), self.next_deadline()).unwrap_or(deadline);
            let wait = wake.saturating_duration_since(now);
            if let Some(msg) = self.wait_for_message(wait) {
                self.apply(msg, Instant::now(), &mut report);
            }
        }
    }

    /// Fire due buffer and scheduler timers at `now`.
    ///
    /// Returns how many deferred renders ran.
    ///
    /// # Errors
    ///
    /// Returns a render error from the triggered flush.
    pub fn fire_timers(&mut self, now: Instant) -> Result<usize, E> {
        self.buffer.tick_at(now);
        let flushed = self.scheduler.tick_at(now)?;
        if flushed > 0 {
            debug_trace!("timer flush ran {flushed} deferred renders");
        }
        Ok(flushed)
    }

    /// Stop capture and move every remaining message into the buffer.
    ///
    /// The final batch flushed by the capture thread is never lost. Timers
    /// are not fired.
    pub fn shutdown(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        if let Some(mut capture) = self.capture.take() {
            capture.shutdown();
        }
        while !self.disconnected {
            match self.receiver.try_recv() {
                Ok(msg) => self.apply(msg, Instant::now(), &mut report),
                // An externally attached sender may still be alive.
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.disconnected = true,
            }
        }
        tracing::debug!(
            messages = report.messages,
            units = report.units,
            "pipeline shut down"
        );
        report
    }

    fn drain_available(&mut self, report: &mut PumpReport) {
        if self.disconnected {
            return;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(msg) => self.apply(msg, Instant::now(), report),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    return;
                }
            }
        }
    }

    fn wait_for_message(&mut self, wait: Duration) -> Option<CaptureMessage> {
        if self.disconnected {
            std::thread::sleep(wait);
            return None;
        }
        match self.receiver.recv_timeout(wait) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected = true;
                None
            }
        }
    }

    fn apply(&mut self, msg: CaptureMessage, now: Instant, report: &mut PumpReport) {
        let mut step = PumpReport {
            messages: 1,
            ..PumpReport::default()
        };
        match msg {
            CaptureMessage::Ready => {
                self.ready = true;
                tracing::debug!("capture ready");
            }
            CaptureMessage::Batch(batch) => {
                step.batches = 1;
                step.units = batch.len();
                if !batch.is_empty() {
                    self.scheduler.on_input_at(now);
                }
                debug_trace!("pipeline batch seq={} units={}", batch.seq, batch.len());
                self.buffer.push_batch_at(batch, now);
            }
            CaptureMessage::DelayWarning(warning) => {
                step.delay_warnings = 1;
                self.delay_warnings += 1;
                tracing::debug!(
                    gap_ms = warning.gap.as_millis() as u64,
                    buffered = warning.buffered_count,
                    "capture delay warning received"
                );
            }
            CaptureMessage::Closed(reason) => {
                if reason.is_fault() {
                    tracing::warn!(%reason, "capture closed");
                } else {
                    tracing::debug!(%reason, "capture closed");
                }
                self.closed = Some(reason.clone());
                step.closed = Some(reason);
            }
        }
        report.absorb(step);
    }
}

impl<E> Drop for Pipeline<E> {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.shutdown();
        }
    }
}
