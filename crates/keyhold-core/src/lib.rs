#![forbid(unsafe_code)]

//! Core: input units and batches, capture batching, timers, configuration,
//! and terminal session lifecycle.

pub mod capture;
pub mod config;
pub mod error;
pub mod handoff;
pub mod input;
pub mod logging;
#[cfg(not(target_arch = "wasm32"))]
pub mod terminal_session;
pub mod timer;

pub use capture::{CaptureSource, CaptureStats, DelayWarning};
pub use config::{BufferConfig, CaptureConfig, PipelineConfig, SchedulerConfig};
pub use error::{CaptureFault, CloseReason, ConfigError, HandoffClosed};
pub use handoff::{CaptureMessage, HandoffReceiver, HandoffSender};
pub use input::{InputBatch, InputUnit, QueuedUnit, UnitContent, Utf8Splitter};
pub use timer::TimerSlot;

// Re-export tracing macros at crate root for ergonomic use.
#[cfg(feature = "tracing")]
pub use logging::{
    debug, debug_span, error, error_span, info, info_span, trace, trace_span, warn, warn_span,
};
