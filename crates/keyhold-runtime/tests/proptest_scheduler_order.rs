//! Property-based tests for render scheduling order.
//!
//! A random interleaving of input, render requests, and clock advances is
//! replayed against the scheduler, with every work item logging its id.
//!
//! 1. Every request runs exactly once by the end (no loss, no duplicates).
//! 2. High-priority requests run before `request_render` returns.
//! 3. Each deferred flush runs entries in (priority, queued_at, submission)
//!    order.
//! 4. At most one max-defer deadline is pending, and it is never later than
//!    `max_defer_ms` after the oldest parked entry.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use keyhold_core::config::SchedulerConfig;
use keyhold_runtime::render_scheduler::{RenderOutcome, RenderPriority, RenderScheduler};
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    Input,
    Request(RenderPriority),
    Advance(u64),
}

fn priority_strategy() -> impl Strategy<Value = RenderPriority> {
    prop_oneof![
        Just(RenderPriority::High),
        Just(RenderPriority::Normal),
        Just(RenderPriority::Low),
    ]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => Just(Step::Input),
        3 => priority_strategy().prop_map(Step::Request),
        2 => (1u64..80).prop_map(Step::Advance),
    ]
}

type Log = Rc<RefCell<Vec<usize>>>;

fn logger(log: &Log, id: usize) -> impl FnOnce() -> Result<(), ()> + 'static {
    let log = Rc::clone(log);
    move || {
        log.borrow_mut().push(id);
        Ok(())
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 1-4. Replay
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn scheduler_order_invariants(steps in prop::collection::vec(step_strategy(), 0..60)) {
        let config = SchedulerConfig::default();
        let max_defer = config.max_defer();
        let mut sched: RenderScheduler<()> = RenderScheduler::new(config).unwrap();
        let log = Log::default();
        let t0 = Instant::now();
        let mut now = t0;
        // (priority, queued_at) indexed by request id.
        let mut requests: Vec<(RenderPriority, Instant)> = Vec::new();

        let check_flush = |log: &Log, from: usize, requests: &[(RenderPriority, Instant)]| {
            let ran = log.borrow()[from..].to_vec();
            let keys: Vec<_> = ran.iter().map(|&id| (requests[id].0, requests[id].1, id)).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            keys == sorted
        };

        for step in steps {
            match step {
                Step::Input => sched.on_input_at(now),
                Step::Request(priority) => {
                    let id = requests.len();
                    requests.push((priority, now));
                    let before = log.borrow().len();
                    let outcome = sched
                        .request_render_at(logger(&log, id), priority, now)
                        .unwrap();
                    if priority == RenderPriority::High {
                        prop_assert_eq!(outcome, RenderOutcome::Executed);
                    }
                    let ran_now = log.borrow().len() > before;
                    prop_assert_eq!(ran_now, outcome == RenderOutcome::Executed);
                }
                Step::Advance(ms) => {
                    now += Duration::from_millis(ms);
                    // Drive every deadline in between, as the pipeline does.
                    while let Some(deadline) = sched.next_deadline().filter(|d| *d <= now) {
                        let before = log.borrow().len();
                        sched.tick_at(deadline).unwrap();
                        prop_assert!(check_flush(&log, before, &requests));
                    }
                }
            }

            if let Some(deadline) = sched.max_defer_deadline() {
                let oldest = sched
                    .deferred()
                    .iter()
                    .map(|e| e.queued_at())
                    .min()
                    .unwrap();
                prop_assert!(deadline <= oldest + max_defer);
            } else {
                prop_assert!(sched.deferred().is_empty() || !sched.is_typing_at(now));
            }
        }

        let before = log.borrow().len();
        sched.flush_deferred_at(now).unwrap();
        prop_assert!(check_flush(&log, before, &requests));

        let mut ran = log.borrow().clone();
        ran.sort_unstable();
        let expected: Vec<usize> = (0..requests.len()).collect();
        prop_assert_eq!(ran, expected);
        prop_assert_eq!(sched.metrics().total_renders, requests.len() as u64);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3b. Deferred mix ordering
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn flush_sorts_any_deferred_mix(
        priorities in prop::collection::vec(
            prop_oneof![Just(RenderPriority::Normal), Just(RenderPriority::Low)],
            1..20,
        ),
    ) {
        let mut sched: RenderScheduler<()> =
            RenderScheduler::new(SchedulerConfig::default().with_idle_threshold_ms(10_000)).unwrap();
        let log = Log::default();
        let t0 = Instant::now();
        sched.on_input_at(t0);
        for (id, priority) in priorities.iter().enumerate() {
            let at = t0 + Duration::from_millis(id as u64);
            prop_assert_eq!(
                sched.request_render_at(logger(&log, id), *priority, at).unwrap(),
                RenderOutcome::Deferred
            );
        }
        prop_assert_eq!(sched.flush_deferred_at(t0 + Duration::from_secs(1)).unwrap(), priorities.len());

        let ran = log.borrow().clone();
        let normals: Vec<usize> = (0..priorities.len()).filter(|&i| priorities[i] == RenderPriority::Normal).collect();
        let lows: Vec<usize> = (0..priorities.len()).filter(|&i| priorities[i] == RenderPriority::Low).collect();
        let expected: Vec<usize> = normals.into_iter().chain(lows).collect();
        prop_assert_eq!(ran, expected);
        prop_assert_eq!(sched.flush_deferred_at(t0 + Duration::from_secs(2)).unwrap(), 0);
    }
}
