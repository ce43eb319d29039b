#![forbid(unsafe_code)]

//! Consumer-side input staging with delay detection.
//!
//! The [`InputBuffer`] receives batches from the handoff channel, stamps
//! each unit with the time it was accepted, and holds it until the
//! application drains the queue with [`flush`](InputBuffer::flush).
//!
//! # Delay Detection
//!
//! Every flush measures the time since the previous flush. A gap above
//! `delay_threshold_ms` while units were waiting means the consumer was
//! stalled (heavy render, GC, remote desktop batching). That is counted as a
//! delay event, folded into `max_delay`, and reported through
//! [`BufferHooks::on_delay_detected`]. Delay is never an error.
//!
//! # Typing Mode
//!
//! Any push turns typing mode on and re-arms a single typing-off timer for
//! `typing_mode_delay_ms`. Typing mode turns off only once that timer has
//! elapsed with no further push.
//!
//! # Invariants
//!
//! - Flush returns units in push order, each exactly once.
//! - `queued_at >= arrived_at` for every queued unit.
//! - At most one typing-off deadline is pending.
//! - Averages over zero elements are zero.
//!
//! # Usage
//!
//! ```
//! use std::time::{Duration, Instant};
//! use keyhold_core::config::BufferConfig;
//! use keyhold_runtime::input_buffer::InputBuffer;
//!
//! let t0 = Instant::now();
//! let mut buffer = InputBuffer::new_at(BufferConfig::default(), t0).unwrap();
//! buffer.push_chunk_at(b"abc", t0, t0);
//! assert!(buffer.is_typing_at(t0));
//!
//! let result = buffer.flush_at(t0 + Duration::from_millis(50));
//! assert_eq!(result.content, b"abc");
//! assert_eq!(result.avg_queue_time, Duration::from_millis(50));
//! ```

use std::borrow::Cow;
use std::time::{Duration, Instant};

use keyhold_core::config::BufferConfig;
use keyhold_core::error::ConfigError;
use keyhold_core::input::{InputBatch, InputUnit, QueuedUnit};
use keyhold_core::timer::TimerSlot;

/// Cumulative buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMetrics {
    /// Units ever pushed.
    pub total_inputs: u64,
    /// Flushes that found units waiting longer than the delay threshold.
    pub delay_events: u64,
    /// Largest delay that raised a delay event.
    pub max_delay: Duration,
    /// Time spent inside flush, summed.
    pub total_processing_time: Duration,
    /// Number of flushes.
    pub flush_count: u64,
}

impl BufferMetrics {
    /// Flush processing time per pushed unit, zero when nothing was pushed.
    #[must_use]
    pub fn avg_processing_time(&self) -> Duration {
        mean(self.total_processing_time, self.total_inputs)
    }
}

/// Payload of the delay notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayEvent {
    /// Time since the previous flush.
    pub delay: Duration,
    /// Units waiting when the delay was detected.
    pub buffered_count: usize,
    /// When the flush ran.
    pub timestamp: Instant,
}

/// Drained queue contents and the timing measured while draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResult {
    /// Raw bytes of all drained units, in push order.
    pub content: Vec<u8>,
    /// Time since the previous flush.
    pub delay: Duration,
    /// Mean time from capture to this flush.
    pub avg_queue_time: Duration,
    /// Mean time from capture to acceptance into the queue.
    pub avg_handoff_time: Duration,
    /// Number of units drained.
    pub count: usize,
}

impl FlushResult {
    /// Content as text, invalid UTF-8 replaced.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Whether nothing was drained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Callback type for delay notifications.
pub type OnDelayDetected = Box<dyn Fn(&DelayEvent) + Send + Sync>;

/// Observer hooks for the input buffer.
pub struct BufferHooks {
    on_delay_detected: Option<OnDelayDetected>,
}

impl Default for BufferHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHooks")
            .field("on_delay_detected", &self.on_delay_detected.is_some())
            .finish()
    }
}

impl BufferHooks {
    /// Create an empty hooks instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            on_delay_detected: None,
        }
    }

    /// Set the callback invoked for every delay event.
    #[must_use]
    pub fn on_delay_detected<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DelayEvent) + Send + Sync + 'static,
    {
        self.on_delay_detected = Some(Box::new(callback));
        self
    }
}

/// Consumer-side input queue.
#[derive(Debug)]
pub struct InputBuffer {
    config: BufferConfig,
    queue: Vec<QueuedUnit>,
    typing: bool,
    typing_timer: TimerSlot,
    last_flush: Instant,
    metrics: BufferMetrics,
    hooks: BufferHooks,
}

impl InputBuffer {
    /// Create a buffer; the first flush measures its delay from now.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: BufferConfig) -> Result<Self, ConfigError> {
        Self::new_at(config, Instant::now())
    }

    /// Create a buffer whose delay clock starts at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new_at(config: BufferConfig, now: Instant) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            queue: Vec::new(),
            typing: false,
            typing_timer: TimerSlot::new(),
            last_flush: now,
            metrics: BufferMetrics::default(),
            hooks: BufferHooks::new(),
        })
    }

    /// Attach observer hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: BufferHooks) -> Self {
        self.set_hooks(hooks);
        self
    }

    /// Replace the observer hooks.
    pub fn set_hooks(&mut self, hooks: BufferHooks) {
        self.hooks = hooks;
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    // -- push --------------------------------------------------------------

    /// Push one unit.
    pub fn push(&mut self, unit: InputUnit) {
        self.push_at(unit, Instant::now());
    }

    /// Push one unit, accepted at `now`.
    pub fn push_at(&mut self, unit: InputUnit, now: Instant) {
        self.push_units_at(std::iter::once(unit), now);
    }

    /// Split a raw chunk that arrived at `arrived_at` and push its units.
    pub fn push_chunk(&mut self, bytes: &[u8], arrived_at: Instant) {
        self.push_chunk_at(bytes, arrived_at, Instant::now());
    }

    /// [`push_chunk`](Self::push_chunk) with the acceptance time given.
    pub fn push_chunk_at(&mut self, bytes: &[u8], arrived_at: Instant, now: Instant) {
        self.push_units_at(InputUnit::split_chunk(bytes, arrived_at), now);
    }

    /// Push a whole capture batch, preserving unit order.
    pub fn push_batch(&mut self, batch: InputBatch) {
        self.push_batch_at(batch, Instant::now());
    }

    /// [`push_batch`](Self::push_batch) with the acceptance time given.
    pub fn push_batch_at(&mut self, batch: InputBatch, now: Instant) {
        self.push_units_at(batch.units, now);
    }

    /// Push units in order, all accepted at `now`.
    ///
    /// An empty push changes nothing, including typing mode.
    pub fn push_units_at<I>(&mut self, units: I, now: Instant)
    where
        I: IntoIterator<Item = InputUnit>,
    {
        let before = self.queue.len();
        self.queue
            .extend(units.into_iter().map(|unit| QueuedUnit::stamp(unit, now)));
        let pushed = self.queue.len() - before;
        if pushed == 0 {
            return;
        }

        self.metrics.total_inputs += pushed as u64;
        self.typing = true;
        self.typing_timer
            .arm(now, self.config.typing_mode_delay());
        tracing::trace!(pushed, queued = self.queue.len(), "input pushed");
    }

    // -- typing mode -------------------------------------------------------

    /// Whether input is actively arriving.
    #[must_use]
    pub fn is_typing(&self) -> bool {
        self.is_typing_at(Instant::now())
    }

    /// Whether input is actively arriving at `now`.
    ///
    /// Read-only: an elapsed typing-off deadline reads as not typing even
    /// before [`tick_at`](Self::tick_at) has processed it.
    #[must_use]
    pub fn is_typing_at(&self, now: Instant) -> bool {
        self.typing && !self.typing_timer.is_due(now)
    }

    /// Fire the typing-off timer if due. Returns `true` on the transition.
    pub fn tick_at(&mut self, now: Instant) -> bool {
        if self.typing_timer.fire_if_due(now) {
            self.typing = false;
            tracing::trace!("typing mode off");
            true
        } else {
            false
        }
    }

    /// Pending typing-off deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.typing_timer.deadline()
    }

    // -- inspection --------------------------------------------------------

    /// Number of queued units.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// Queued content as raw bytes, without draining.
    #[must_use]
    pub fn peek(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.queue.len());
        for queued in &self.queue {
            queued.unit.content.encode_into(&mut out);
        }
        out
    }

    /// Queued content as text, without draining.
    #[must_use]
    pub fn peek_text(&self) -> String {
        String::from_utf8_lossy(&self.peek()).into_owned()
    }

    /// Queued units with their timestamps, without draining.
    #[must_use]
    pub fn peek_units(&self) -> &[QueuedUnit] {
        &self.queue
    }

    // -- flush -------------------------------------------------------------

    /// Drain the queue.
    pub fn flush(&mut self) -> FlushResult {
        self.flush_at(Instant::now())
    }

    /// Drain the queue at `now`.
    pub fn flush_at(&mut self, now: Instant) -> FlushResult {
        let started = Instant::now();
        let delay = now.saturating_duration_since(self.last_flush);
        let count = self.queue.len();

        if count > 0 && delay > self.config.delay_threshold() {
            self.metrics.delay_events += 1;
            self.metrics.max_delay = self.metrics.max_delay.max(delay);
            let event = DelayEvent {
                delay,
                buffered_count: count,
                timestamp: now,
            };
            tracing::warn!(
                delay_ms = delay.as_millis() as u64,
                buffered = count,
                "consumer delay detected"
            );
            if let Some(ref callback) = self.hooks.on_delay_detected {
                callback(&event);
            }
        }

        let mut content = Vec::with_capacity(count);
        let mut queue_total = Duration::ZERO;
        let mut handoff_total = Duration::ZERO;
        for queued in self.queue.drain(..) {
            queued.unit.content.encode_into(&mut content);
            queue_total += now.saturating_duration_since(queued.unit.arrived_at);
            handoff_total += queued.handoff_latency();
        }
        self.last_flush = now;

        self.metrics.flush_count += 1;
        self.metrics.total_processing_time += started.elapsed();

        FlushResult {
            content,
            delay,
            avg_queue_time: mean(queue_total, count as u64),
            avg_handoff_time: mean(handoff_total, count as u64),
            count,
        }
    }

    // -- metrics -----------------------------------------------------------

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        self.metrics
    }

    /// Zero the counters. Queue and typing mode are untouched.
    pub fn reset_metrics(&mut self) {
        self.metrics = BufferMetrics::default();
    }
}

fn mean(total: Duration, n: u64) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((total.as_nanos() / u128::from(n)) as u64)
}
