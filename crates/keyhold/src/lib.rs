#![forbid(unsafe_code)]

//! Keyhold public facade crate.
//!
//! Re-exports the pipeline pieces from the internal crates and adds a
//! single error type plus a prelude for applications that just want typed
//! input to stay responsive while they render.

use std::fmt;

// --- Core re-exports -------------------------------------------------------

pub use keyhold_core::config::{BufferConfig, CaptureConfig, PipelineConfig, SchedulerConfig};
pub use keyhold_core::error::{CaptureFault, CloseReason, ConfigError};
pub use keyhold_core::input::{InputBatch, InputUnit, UnitContent};
#[cfg(not(target_arch = "wasm32"))]
pub use keyhold_core::terminal_session::TerminalSession;

// --- Runtime re-exports ----------------------------------------------------

pub use keyhold_runtime::{
    BufferHooks, BufferMetrics, CaptureHandle, DelayEvent, FlushResult, InputBuffer, Pipeline,
    PumpReport, RenderMetrics, RenderOutcome, RenderPriority, RenderScheduler, SpawnError,
};

// --- Errors ---------------------------------------------------------------

/// Top-level error type for keyhold apps.
#[derive(Debug)]
pub enum Error {
    /// I/O failure while starting capture or rendering.
    Io(std::io::Error),
    /// Rejected configuration.
    Config(ConfigError),
    /// The capture loop stopped on a read error.
    Capture(CaptureFault),
}

impl Error {
    /// Turn a capture close reason into an error if it was a fault.
    #[must_use]
    pub fn from_close(reason: &CloseReason) -> Option<Self> {
        match reason {
            CloseReason::Fault(fault) => Some(Self::Capture(fault.clone())),
            CloseReason::Shutdown | CloseReason::Eof => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Capture(fault) => write!(f, "{fault}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Capture(fault) => Some(fault),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<CaptureFault> for Error {
    fn from(fault: CaptureFault) -> Self {
        Self::Capture(fault)
    }
}

impl From<SpawnError> for Error {
    fn from(err: SpawnError) -> Self {
        match err {
            SpawnError::Config(err) => Self::Config(err),
            SpawnError::Io(err) => Self::Io(err),
        }
    }
}

/// Standard result type for keyhold APIs.
pub type Result<T> = std::result::Result<T, Error>;

// --- Prelude --------------------------------------------------------------

/// Everything a typical main loop needs: `use keyhold::prelude::*;`.
pub mod prelude {
    pub use crate::{
        CaptureConfig, CloseReason, Error, FlushResult, Pipeline, PipelineConfig, PumpReport,
        RenderOutcome, RenderPriority, Result,
    };

    pub use crate::{core, runtime};
}

pub use keyhold_core as core;
pub use keyhold_runtime as runtime;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn spawn_error_maps_to_matching_variant() {
        let config = ConfigError::InvalidValue {
            field: "max_defer_ms",
            value: 0,
            reason: "must be greater than zero",
        };
        let err: Error = SpawnError::Config(config.clone()).into();
        assert!(matches!(err, Error::Config(ref e) if *e == config));

        let err: Error = SpawnError::Io(io::Error::other("no tty")).into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "no tty");
    }

    #[test]
    fn only_faults_become_errors() {
        assert!(Error::from_close(&CloseReason::Eof).is_none());
        assert!(Error::from_close(&CloseReason::Shutdown).is_none());

        let fault = CaptureFault::from_io(&io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let err = Error::from_close(&CloseReason::Fault(fault.clone())).unwrap();
        assert!(matches!(err, Error::Capture(ref f) if *f == fault));
        assert!(err.source().is_some());
    }
}
