//! End-to-end tests: real capture threads feeding a pipeline.
//!
//! The host stream is an in-memory reader that blocks until the test feeds
//! it, so arrival timing is under test control while every thread, channel,
//! and timer is real.

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use keyhold_core::config::{CaptureConfig, PipelineConfig, SchedulerConfig};
use keyhold_core::error::CloseReason;
use keyhold_runtime::input_buffer::BufferHooks;
use keyhold_runtime::pipeline::Pipeline;
use keyhold_runtime::render_scheduler::{RenderOutcome, RenderPriority};

/// Reader that blocks until the test sends a chunk; hanging up is EOF.
struct FeedReader(mpsc::Receiver<Vec<u8>>);

impl Read for FeedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv() {
            Ok(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Err(_) => Ok(0),
        }
    }
}

fn config() -> PipelineConfig {
    PipelineConfig::default().with_capture(CaptureConfig::default().with_raw_mode(false))
}

fn spawn(config: PipelineConfig) -> (mpsc::Sender<Vec<u8>>, Pipeline) {
    let (feed, source) = mpsc::channel();
    let pipeline = Pipeline::spawn(FeedReader(source), config).expect("spawn pipeline");
    (feed, pipeline)
}

/// Pump until `cond` holds or `limit` elapses.
fn pump_until<F>(pipeline: &mut Pipeline, limit: Duration, mut cond: F) -> bool
where
    F: FnMut(&Pipeline) -> bool,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        pipeline.pump_until(deadline).expect("pump");
        if cond(pipeline) {
            return true;
        }
    }
    cond(pipeline)
}

#[test]
fn typed_input_arrives_in_order() {
    let (feed, mut pipeline) = spawn(config());
    for chunk in ["h", "el", "lo", " wörld"] {
        feed.send(chunk.as_bytes().to_vec()).unwrap();
    }

    let reached = pump_until(&mut pipeline, Duration::from_secs(2), |p| {
        p.buffer().size() == "hello wörld".chars().count()
    });
    assert!(reached, "input never reached the buffer");
    assert!(pipeline.is_ready());

    let result = pipeline.buffer_mut().flush();
    assert_eq!(result.text(), "hello wörld");
    assert!(result.avg_handoff_time <= result.avg_queue_time);
}

#[test]
fn deferred_render_fires_within_max_defer() {
    // Long idle threshold: only the max-defer timer can flush.
    let scheduler = SchedulerConfig::default()
        .with_idle_threshold_ms(5_000)
        .with_max_defer_ms(200);
    let (feed, mut pipeline) = spawn(config().with_scheduler(scheduler));

    feed.send(b"k".to_vec()).unwrap();
    assert!(pump_until(&mut pipeline, Duration::from_secs(2), |p| p
        .buffer()
        .size()
        == 1));

    // Stamped inside the work: pump only returns at its own deadline.
    let ran_at: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let stamps = Arc::clone(&ran_at);
    let requested = Instant::now();
    let outcome = pipeline
        .request_render(
            move || {
                stamps.lock().unwrap().push(Instant::now());
                Ok(())
            },
            RenderPriority::Normal,
        )
        .unwrap();
    assert_eq!(outcome, RenderOutcome::Deferred);

    let done = pump_until(&mut pipeline, Duration::from_secs(1), |_| {
        !ran_at.lock().unwrap().is_empty()
    });
    assert!(done, "deferred render never ran");

    let runs = ran_at.lock().unwrap().clone();
    assert_eq!(runs.len(), 1);
    let elapsed = runs[0].duration_since(requested);
    assert!(elapsed >= Duration::from_millis(200), "ran early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "ran late: {elapsed:?}");
    assert_eq!(pipeline.scheduler().metrics().deferred_renders, 1);
    drop(feed);
}

#[test]
fn high_priority_runs_during_typing() {
    let (feed, mut pipeline) = spawn(config());
    feed.send(b"x".to_vec()).unwrap();
    assert!(pump_until(&mut pipeline, Duration::from_secs(2), |p| p
        .buffer()
        .size()
        == 1));

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    pipeline
        .request_render(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            RenderPriority::High,
        )
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    drop(feed);
}

#[test]
fn shutdown_keeps_final_batch() {
    let capture = CaptureConfig::default()
        .with_raw_mode(false)
        .with_coalesce_window_ms(10_000);
    let (feed, mut pipeline) = spawn(config().with_capture(capture));
    feed.send(b"pending".to_vec()).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let report = pipeline.shutdown();
    assert_eq!(report.closed, Some(CloseReason::Shutdown));
    assert_eq!(pipeline.buffer().peek(), b"pending");
    drop(feed);
}

#[test]
fn eof_closes_pipeline() {
    let (feed, mut pipeline) = spawn(config());
    feed.send(b"bye".to_vec()).unwrap();
    drop(feed);

    assert!(pump_until(&mut pipeline, Duration::from_secs(2), Pipeline::is_closed));
    assert_eq!(pipeline.close_reason(), Some(&CloseReason::Eof));
    assert_eq!(pipeline.buffer_mut().flush().content, b"bye");
}

#[test]
fn stalled_consumer_raises_delay_event() {
    let events = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&events);
    let (feed, pipeline) = spawn(config());
    let mut pipeline = pipeline.with_buffer_hooks(BufferHooks::new().on_delay_detected(move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    }));

    feed.send(b"a".to_vec()).unwrap();
    assert!(pump_until(&mut pipeline, Duration::from_secs(2), |p| p
        .buffer()
        .size()
        == 1));
    // A heavy frame keeps the consumer away from the buffer.
    std::thread::sleep(Duration::from_millis(80));

    let result = pipeline.buffer_mut().flush();
    assert!(result.delay > Duration::from_millis(50));
    assert_eq!(events.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.buffer().metrics().delay_events, 1);
    drop(feed);
}

#[test]
fn arrival_gap_raises_warning_alongside_batch() {
    let capture = CaptureConfig::default()
        .with_raw_mode(false)
        .with_coalesce_window_ms(500);
    let (feed, mut pipeline) = spawn(config().with_capture(capture));

    feed.send(b"a".to_vec()).unwrap();
    std::thread::sleep(Duration::from_millis(80));
    feed.send(b"b".to_vec()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let (mut warnings, mut batches) = (0, 0);
    while pipeline.buffer().size() < 2 && Instant::now() < deadline {
        let report = pipeline.pump_until(deadline).unwrap();
        warnings += report.delay_warnings;
        batches += report.batches;
    }
    assert_eq!(warnings, 1);
    assert_eq!(pipeline.delay_warnings(), 1);
    assert_eq!(batches, 1);

    // Both chunks share the one window: the warning did not split the batch.
    assert_eq!(pipeline.buffer().metrics().total_inputs, 2);
    assert_eq!(pipeline.buffer_mut().flush().content, b"ab");

    let report = pipeline.shutdown();
    assert_eq!(report.delay_warnings, 0);
    drop(feed);
}
