#![forbid(unsafe_code)]

//! Input-aware render scheduling.
//!
//! The [`RenderScheduler`] decides, per unit of render work, whether it runs
//! now or waits. While input is actively arriving, non-critical work is
//! parked in a deferred queue so rendering never competes with keystroke
//! delivery; once input goes quiet, or once the oldest parked work has
//! waited `max_defer_ms`, the queue is flushed in priority order.
//!
//! # State Machine
//!
//! ```text
//!            on_input (arm idle timer)
//!   ┌──────┐ ─────────────────────────▶ ┌────────┐
//!   │ Idle │                            │ Typing │ ◀─┐ on_input (re-arm)
//!   └──────┘ ◀───────────────────────── └────────┘ ──┘
//!            idle timer fires → flush_deferred
//! ```
//!
//! | Request | Region | Effect |
//! |---------|--------|--------|
//! | `High` | any | execute immediately |
//! | `Normal`/`Low` | typing | enqueue, arm max-defer timer if idle |
//! | `Normal`/`Low` | idle | execute immediately |
//!
//! # Invariants
//!
//! 1. At most one idle timer and one max-defer timer are pending.
//! 2. Flush order is priority ascending (`High < Normal < Low`), then
//!    `queued_at` ascending, then submission order.
//! 3. A deferred entry runs at most once.
//! 4. A render error is returned unchanged, after its duration has been
//!    recorded.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Work item returns `Err` | Metrics updated, error returned |
//! | Error mid-flush | Pass aborts, unexecuted entries re-queued in order, max-defer re-armed |
//! | Work item panics | Metrics updated during unwinding, panic propagates |

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use keyhold_core::config::SchedulerConfig;
use keyhold_core::error::ConfigError;
use keyhold_core::timer::{self, TimerSlot};

/// Priority of a render request.
///
/// Declaration order is flush order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RenderPriority {
    /// Never deferred (e.g. echoing the user's own keystroke).
    High,
    /// Deferred while typing.
    #[default]
    Normal,
    /// Deferred while typing, flushed last.
    Low,
}

impl RenderPriority {
    /// Stable string label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// What happened to a render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The work ran before the request returned.
    Executed,
    /// The work was parked in the deferred queue.
    Deferred,
}

/// Boxed unit of render work.
pub type RenderWork<E> = Box<dyn FnOnce() -> Result<(), E>>;

/// Parked render work.
pub struct DeferredRenderEntry<E> {
    work: RenderWork<E>,
    priority: RenderPriority,
    queued_at: Instant,
    seq: u64,
}

impl<E> DeferredRenderEntry<E> {
    /// Priority of the parked work.
    #[must_use]
    pub fn priority(&self) -> RenderPriority {
        self.priority
    }

    /// When the work was parked.
    #[must_use]
    pub fn queued_at(&self) -> Instant {
        self.queued_at
    }

    fn order_key(&self) -> (RenderPriority, Instant, u64) {
        (self.priority, self.queued_at, self.seq)
    }
}

impl<E> fmt::Debug for DeferredRenderEntry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredRenderEntry")
            .field("priority", &self.priority)
            .field("queued_at", &self.queued_at)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Cumulative render counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderMetrics {
    /// Work items executed, by any path.
    pub total_renders: u64,
    /// Requests parked in the deferred queue.
    pub deferred_renders: u64,
    /// Work items executed on the immediate path.
    pub immediate_renders: u64,
    /// Executions that returned an error or panicked.
    pub failed_renders: u64,
    /// Non-empty deferred flushes.
    pub flushes: u64,
    /// Running mean execution time.
    pub avg_render_time: Duration,
    /// Longest execution time.
    pub max_render_time: Duration,
}

impl RenderMetrics {
    fn record(&mut self, duration: Duration, immediate: bool, ok: bool) {
        self.total_renders += 1;
        if immediate {
            self.immediate_renders += 1;
        }
        if !ok {
            self.failed_renders += 1;
        }
        self.max_render_time = self.max_render_time.max(duration);
        let n = u128::from(self.total_renders);
        let avg = (self.avg_render_time.as_nanos() * (n - 1) + duration.as_nanos()) / n;
        self.avg_render_time = Duration::from_nanos(avg as u64);
    }
}

/// Defers non-critical render work while input is arriving.
pub struct RenderScheduler<E = io::Error> {
    config: SchedulerConfig,
    deferred: Vec<DeferredRenderEntry<E>>,
    typing: bool,
    idle_timer: TimerSlot,
    max_defer_timer: TimerSlot,
    next_seq: u64,
    metrics: RenderMetrics,
}

impl<E> fmt::Debug for RenderScheduler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderScheduler")
            .field("config", &self.config)
            .field("deferred", &self.deferred.len())
            .field("typing", &self.typing)
            .field("idle_timer", &self.idle_timer)
            .field("max_defer_timer", &self.max_defer_timer)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl<E> RenderScheduler<E> {
    /// Create a scheduler in the idle region.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            deferred: Vec::new(),
            typing: false,
            idle_timer: TimerSlot::new(),
            max_defer_timer: TimerSlot::new(),
            next_seq: 0,
            metrics: RenderMetrics::default(),
        })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // -- input -------------------------------------------------------------

    /// Record that input arrived now.
    pub fn on_input(&mut self) {
        self.on_input_at(Instant::now());
    }

    /// Record that input arrived at `now`: enter typing and re-arm the idle
    /// timer.
    pub fn on_input_at(&mut self, now: Instant) {
        if !self.typing {
            tracing::trace!("render scheduler entering typing region");
        }
        self.typing = true;
        self.idle_timer.arm(now, self.config.idle_threshold());
    }

    /// Whether the scheduler is in the typing region at `now`.
    #[must_use]
    pub fn is_typing_at(&self, now: Instant) -> bool {
        self.typing && !self.idle_timer.is_due(now)
    }

    // -- requests ----------------------------------------------------------

    /// Request a render now.
    ///
    /// # Errors
    ///
    /// Returns the work item's error if it ran and failed.
    pub fn request_render<F>(&mut self, work: F, priority: RenderPriority) -> Result<RenderOutcome, E>
    where
        F: FnOnce() -> Result<(), E> + 'static,
    {
        self.request_render_at(work, priority, Instant::now())
    }

    /// Request a render at `now`.
    ///
    /// # Errors
    ///
    /// Returns the work item's error if it ran and failed.
    pub fn request_render_at<F>(
        &mut self,
        work: F,
        priority: RenderPriority,
        now: Instant,
    ) -> Result<RenderOutcome, E>
    where
        F: FnOnce() -> Result<(), E> + 'static,
    {
        if priority != RenderPriority::High && self.is_typing_at(now) {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.deferred.push(DeferredRenderEntry {
                work: Box::new(work),
                priority,
                queued_at: now,
                seq,
            });
            self.metrics.deferred_renders += 1;
            if self.max_defer_timer.arm_if_idle(now, self.config.max_defer()) {
                tracing::trace!(
                    max_defer_ms = self.config.max_defer_ms,
                    "max-defer timer armed"
                );
            }
            return Ok(RenderOutcome::Deferred);
        }

        self.execute_render(work)?;
        Ok(RenderOutcome::Executed)
    }

    /// Run a work item now on the immediate path, recording its duration.
    ///
    /// # Errors
    ///
    /// Returns the work item's error unchanged.
    pub fn execute_render<F>(&mut self, work: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        self.run(work, true)
    }

    fn run<F>(&mut self, work: F, immediate: bool) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        let mut record = scopeguard::guard(
            (&mut self.metrics, Instant::now(), false),
            move |(metrics, started, ok)| metrics.record(started.elapsed(), immediate, ok),
        );
        let result = work();
        record.2 = result.is_ok();
        result
    }

    // -- flush -------------------------------------------------------------

    /// Flush the deferred queue now.
    ///
    /// # Errors
    ///
    /// Returns the first work item error; see [`flush_deferred_at`](Self::flush_deferred_at).
    pub fn flush_deferred(&mut self) -> Result<usize, E> {
        self.flush_deferred_at(Instant::now())
    }

    /// Execute every deferred entry in priority then FIFO order.
    ///
    /// Cancels the max-defer timer. Returns how many entries ran.
    ///
    /// # Errors
    ///
    /// On the first failing entry the pass stops and the error is returned.
    /// Entries that had not run yet go back into the queue in the same
    /// order and the max-defer timer is re-armed from `now`.
    pub fn flush_deferred_at(&mut self, now: Instant) -> Result<usize, E> {
        self.max_defer_timer.cancel();
        if self.deferred.is_empty() {
            return Ok(0);
        }

        let mut entries = std::mem::take(&mut self.deferred);
        entries.sort_by_key(DeferredRenderEntry::order_key);
        self.metrics.flushes += 1;
        tracing::debug!(entries = entries.len(), "flushing deferred renders");

        let mut executed = 0;
        let mut pending = entries.into_iter();
        while let Some(entry) = pending.next() {
            if let Err(err) = self.run(entry.work, false) {
                self.deferred.extend(pending);
                if !self.deferred.is_empty() {
                    self.max_defer_timer.arm(now, self.config.max_defer());
                }
                tracing::debug!(
                    executed,
                    requeued = self.deferred.len(),
                    "deferred flush aborted by render error"
                );
                return Err(err);
            }
            executed += 1;
        }
        Ok(executed)
    }

    // -- timers ------------------------------------------------------------

    /// Fire due timers now.
    ///
    /// # Errors
    ///
    /// Returns a render error from the triggered flush.
    pub fn tick(&mut self) -> Result<usize, E> {
        self.tick_at(Instant::now())
    }

    /// Fire due timers at `now`.
    ///
    /// The idle timer moves the scheduler to the idle region; either timer
    /// triggers one flush, which also cancels the max-defer timer. Returns
    /// how many deferred entries ran.
    ///
    /// # Errors
    ///
    /// Returns a render error from the triggered flush.
    pub fn tick_at(&mut self, now: Instant) -> Result<usize, E> {
        let went_idle = self.idle_timer.fire_if_due(now);
        if went_idle {
            self.typing = false;
            tracing::trace!("render scheduler idle");
        }
        let max_defer = self.max_defer_timer.fire_if_due(now);
        if max_defer {
            tracing::debug!(
                deferred = self.deferred.len(),
                "max-defer timer fired"
            );
        }
        if went_idle || max_defer {
            self.flush_deferred_at(now)
        } else {
            Ok(0)
        }
    }

    /// Earliest pending timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        timer::earliest(self.idle_timer.deadline(), self.max_defer_timer.deadline())
    }

    // -- inspection --------------------------------------------------------

    /// Whether work is parked while typing.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.is_deferred_at(Instant::now())
    }

    /// Whether work is parked while typing at `now`.
    #[must_use]
    pub fn is_deferred_at(&self, now: Instant) -> bool {
        self.is_typing_at(now) && !self.deferred.is_empty()
    }

    /// Number of parked entries.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Parked entries, in submission order.
    #[must_use]
    pub fn deferred(&self) -> &[DeferredRenderEntry<E>] {
        &self.deferred
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> RenderMetrics {
        self.metrics
    }

    /// Pending max-defer deadline.
    #[must_use]
    pub fn max_defer_deadline(&self) -> Option<Instant> {
        self.max_defer_timer.deadline()
    }
}
