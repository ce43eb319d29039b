#![forbid(unsafe_code)]

//! Keyhold Runtime
//!
//! The moving parts of the input pipeline, built on the pure state machines
//! and types in `keyhold-core`.
//!
//! # Key Components
//!
//! - [`spawn_capture`] - Capture threads reading the host stream
//! - [`InputBuffer`] - Consumer-side queue with typing mode and delay detection
//! - [`RenderScheduler`] - Defers non-critical render work while typing
//! - [`Pipeline`] - Drives channel → buffer → scheduler and fires timers
//!
//! # How it fits together
//! Capture runs on its own threads and never blocks on the consumer. The
//! application owns a [`Pipeline`] on its main thread, pumps it between
//! frames, drains typed input with [`InputBuffer::flush`], and submits render
//! work through the scheduler so heavy frames yield to keystrokes.

pub mod capture_thread;
pub mod debug_trace;
pub mod input_buffer;
pub mod pipeline;
pub mod render_scheduler;

pub use capture_thread::{CaptureHandle, SpawnError, spawn_capture, spawn_stdin_capture};
pub use input_buffer::{BufferHooks, BufferMetrics, DelayEvent, FlushResult, InputBuffer};
pub use pipeline::{Pipeline, PumpReport};
pub use render_scheduler::{
    DeferredRenderEntry, RenderMetrics, RenderOutcome, RenderPriority, RenderScheduler, RenderWork,
};
