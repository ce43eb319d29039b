#![forbid(unsafe_code)]

//! Single-slot deadline timers.
//!
//! Every timer in the pipeline has one purpose (typing-mode off, idle
//! transition, max-defer flush, capture coalescing window) and at most one
//! pending instance. [`TimerSlot`] makes that structural: it holds an
//! optional deadline, arming replaces the previous deadline, and firing
//! disarms it. Nothing runs on its own; the owner polls
//! [`fire_if_due`](TimerSlot::fire_if_due) from its `tick_at`, and the
//! driver sleeps until the earliest [`deadline`](TimerSlot::deadline).
//!
//! Each arm bumps a generation counter so tests can assert that re-arming
//! replaced, rather than stacked, a pending timer.

use std::time::{Duration, Instant};

/// A cancellable, re-armable deadline with at most one pending instance.
#[derive(Debug, Clone, Default)]
pub struct TimerSlot {
    deadline: Option<Instant>,
    generation: u64,
    fired: u64,
}

impl TimerSlot {
    /// Create a disarmed slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot for `now + delay`, cancelling any pending deadline.
    pub fn arm(&mut self, now: Instant, delay: Duration) -> Instant {
        let deadline = now + delay;
        self.deadline = Some(deadline);
        self.generation += 1;
        deadline
    }

    /// Arm the slot only if nothing is pending.
    ///
    /// Returns `true` if a new deadline was armed.
    pub fn arm_if_idle(&mut self, now: Instant, delay: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.arm(now, delay);
        true
    }

    /// Cancel the pending deadline, if any.
    ///
    /// Returns `true` if something was cancelled.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Whether a deadline is pending.
    #[inline]
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The pending deadline.
    #[inline]
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the pending deadline has been reached at `now`.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Disarm and return `true` if the deadline has been reached.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.deadline = None;
            self.fired += 1;
            true
        } else {
            false
        }
    }

    /// Time left until the deadline (zero if overdue), `None` when disarmed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|d| d.checked_duration_since(now).unwrap_or(Duration::ZERO))
    }

    /// Number of times the slot has been armed.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of times the slot has fired.
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.fired
    }
}

/// Earliest of two optional deadlines.
#[must_use]
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn new_slot_is_disarmed() {
        let slot = TimerSlot::new();
        assert!(!slot.is_armed());
        assert_eq!(slot.remaining(Instant::now()), None);
    }

    #[test]
    fn rearm_replaces_deadline() {
        let base = Instant::now();
        let mut slot = TimerSlot::new();
        slot.arm(base, 100 * MS);
        slot.arm(base + 40 * MS, 100 * MS);

        assert_eq!(slot.generation(), 2);
        assert_eq!(slot.deadline(), Some(base + 140 * MS));
        // The first deadline no longer fires.
        assert!(!slot.fire_if_due(base + 100 * MS));
        assert!(slot.fire_if_due(base + 140 * MS));
        assert!(!slot.is_armed());
        assert_eq!(slot.fired_count(), 1);
    }

    #[test]
    fn arm_if_idle_keeps_existing_deadline() {
        let base = Instant::now();
        let mut slot = TimerSlot::new();
        assert!(slot.arm_if_idle(base, 200 * MS));
        assert!(!slot.arm_if_idle(base + 50 * MS, 200 * MS));
        assert_eq!(slot.deadline(), Some(base + 200 * MS));
        assert_eq!(slot.generation(), 1);
    }

    #[test]
    fn fire_is_one_shot() {
        let base = Instant::now();
        let mut slot = TimerSlot::new();
        slot.arm(base, 5 * MS);
        assert!(slot.fire_if_due(base + 10 * MS));
        assert!(!slot.fire_if_due(base + 20 * MS));
    }

    #[test]
    fn cancel_reports_whether_pending() {
        let mut slot = TimerSlot::new();
        assert!(!slot.cancel());
        slot.arm(Instant::now(), 5 * MS);
        assert!(slot.cancel());
        assert!(!slot.is_armed());
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let base = Instant::now();
        let mut slot = TimerSlot::new();
        slot.arm(base, 5 * MS);
        assert_eq!(slot.remaining(base + 2 * MS), Some(3 * MS));
        assert_eq!(slot.remaining(base + 9 * MS), Some(Duration::ZERO));
    }

    #[test]
    fn earliest_picks_minimum() {
        let base = Instant::now();
        let later = base + 10 * MS;
        assert_eq!(earliest(Some(later), Some(base)), Some(base));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(Some(base), None), Some(base));
        assert_eq!(earliest(None, None), None);
    }
}
