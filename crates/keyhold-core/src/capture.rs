#![forbid(unsafe_code)]

//! Capture-side batching of raw input chunks.
//!
//! [`CaptureSource`] is the state machine that runs on the capture thread.
//! It never blocks and never reads the clock itself; the thread that owns it
//! feeds it chunks with their arrival time and polls its coalescing timer.
//!
//! # Batching
//!
//! - Every chunk is split into units stamped with the chunk's arrival time.
//! - Units accumulate in a pending batch.
//! - The first unit of a pending batch arms the coalescing timer; later
//!   units never re-arm it, so a batch is handed off at most
//!   `coalesce_window_ms` after its first unit arrived.
//! - When the timer fires the whole pending batch leaves as one
//!   [`InputBatch`] and the pending batch is cleared.
//!
//! # Delay Warnings
//!
//! If a chunk arrives more than `delay_warning_ms` after the previous one
//! while a batch is still pending, a [`DelayWarning`] is returned next to
//! the normal batching (the chunk is still batched). The gap is measured at
//! the capture boundary, so it points at slow draining on the consumer side
//! rather than at lost input in capture.
//!
//! # Usage
//!
//! ```
//! use std::time::{Duration, Instant};
//! use keyhold_core::capture::CaptureSource;
//! use keyhold_core::config::CaptureConfig;
//!
//! let mut source = CaptureSource::new(CaptureConfig::default());
//! let t0 = Instant::now();
//! source.ingest_at(b"ab", t0);
//! source.ingest_at(b"c", t0 + Duration::from_millis(1));
//!
//! // Window still open.
//! assert!(source.tick_at(t0 + Duration::from_millis(2)).is_none());
//!
//! let batch = source.tick_at(t0 + Duration::from_millis(5)).unwrap();
//! assert_eq!(batch.content(), b"abc");
//! ```

use std::time::{Duration, Instant};

use crate::config::CaptureConfig;
use crate::input::{InputBatch, InputUnit, Utf8Splitter};
use crate::timer::TimerSlot;

/// Out-of-band notice that arrivals at the capture boundary were far apart
/// while a batch was pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWarning {
    /// Gap between the previous and current chunk arrivals.
    pub gap: Duration,
    /// Units pending in the batch when the late chunk arrived.
    pub buffered_count: usize,
    /// Arrival time of the late chunk.
    pub at: Instant,
}

/// Counters for one capture source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Non-empty chunks ingested.
    pub chunks: u64,
    /// Raw bytes ingested.
    pub bytes: u64,
    /// Units produced.
    pub units: u64,
    /// Batches handed off.
    pub batches: u64,
    /// Delay warnings raised.
    pub delay_warnings: u64,
}

/// Coalescing batcher for raw input chunks.
#[derive(Debug)]
pub struct CaptureSource {
    config: CaptureConfig,
    splitter: Utf8Splitter,
    pending: Vec<InputUnit>,
    flush_timer: TimerSlot,
    last_arrival: Option<Instant>,
    next_seq: u64,
    stats: CaptureStats,
}

impl CaptureSource {
    /// Create a capture source.
    ///
    /// The configuration is expected to be validated; see
    /// [`CaptureConfig::validate`].
    #[must_use]
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            splitter: Utf8Splitter::new(),
            pending: Vec::new(),
            flush_timer: TimerSlot::new(),
            last_arrival: None,
            next_seq: 0,
            stats: CaptureStats::default(),
        }
    }

    /// Ingest a chunk that arrived now.
    pub fn ingest(&mut self, bytes: &[u8]) -> Option<DelayWarning> {
        self.ingest_at(bytes, Instant::now())
    }

    /// Ingest a chunk that arrived at `now`.
    ///
    /// Returns a delay warning when the gap since the previous chunk exceeds
    /// the warning threshold while a batch is pending.
    pub fn ingest_at(&mut self, bytes: &[u8], now: Instant) -> Option<DelayWarning> {
        if bytes.is_empty() {
            return None;
        }

        let warning = match self.last_arrival {
            Some(prev) if !self.pending.is_empty() => {
                let gap = now.saturating_duration_since(prev);
                (gap > self.config.delay_warning()).then_some(DelayWarning {
                    gap,
                    buffered_count: self.pending.len(),
                    at: now,
                })
            }
            _ => None,
        };
        if let Some(ref w) = warning {
            self.stats.delay_warnings += 1;
            crate::debug!(
                gap_ms = w.gap.as_millis() as u64,
                buffered = w.buffered_count,
                "capture arrival gap exceeded threshold"
            );
        }

        self.last_arrival = Some(now);
        self.stats.chunks += 1;
        self.stats.bytes += bytes.len() as u64;

        let units = self.splitter.split(bytes, now);
        self.stats.units += units.len() as u64;
        self.pending.extend(units);

        if !self.pending.is_empty() {
            self.flush_timer
                .arm_if_idle(now, self.config.coalesce_window());
        }

        warning
    }

    /// Poll the coalescing timer now.
    pub fn tick(&mut self) -> Option<InputBatch> {
        self.tick_at(Instant::now())
    }

    /// Poll the coalescing timer at `now`.
    ///
    /// Returns the pending batch once the window has elapsed.
    pub fn tick_at(&mut self, now: Instant) -> Option<InputBatch> {
        if self.flush_timer.fire_if_due(now) {
            self.take_batch(now)
        } else {
            None
        }
    }

    /// Hand off the pending batch immediately, regardless of the timer.
    ///
    /// Bytes of an incomplete UTF-8 character stay carried.
    pub fn flush_at(&mut self, now: Instant) -> Option<InputBatch> {
        self.flush_timer.cancel();
        self.take_batch(now)
    }

    /// Final flush before the capture loop exits.
    ///
    /// Carried bytes of an incomplete UTF-8 character are emitted as opaque
    /// units so nothing captured is lost.
    pub fn finish_at(&mut self, now: Instant) -> Option<InputBatch> {
        let tail = self.splitter.finish(now);
        self.stats.units += tail.len() as u64;
        self.pending.extend(tail);
        self.flush_at(now)
    }

    /// Time until the coalescing timer fires, `None` when nothing is pending.
    #[must_use]
    pub fn time_until_flush(&self, now: Instant) -> Option<Duration> {
        self.flush_timer.remaining(now)
    }

    /// Deadline of the coalescing timer.
    #[must_use]
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_timer.deadline()
    }

    /// Whether units are waiting to be handed off.
    #[inline]
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of units waiting to be handed off.
    #[inline]
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    fn take_batch(&mut self, now: Instant) -> Option<InputBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let batch = InputBatch {
            units: std::mem::take(&mut self.pending),
            batch_timestamp: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.stats.batches += 1;
        crate::trace!(
            seq = batch.seq,
            units = batch.len(),
            "capture batch ready"
        );
        Some(batch)
    }
}
