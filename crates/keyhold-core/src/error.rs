#![forbid(unsafe_code)]

//! Error taxonomy for the capture pipeline.
//!
//! | Fault | Type | Effect |
//! |-------|------|--------|
//! | Host stream errors or closes | [`CaptureFault`] / [`CloseReason`] | Capture flushes and terminates, no retry |
//! | Invalid configuration | [`ConfigError`] | Construction fails fast |
//! | Consumer side of the handoff is gone | [`HandoffClosed`] | Capture stops producing |
//!
//! Render work item failures are not represented here: they use the
//! application's own error type and are returned unchanged by the scheduler.
//! Slow consumers and deferred-queue buildup are never errors; they surface
//! as metrics and hook callbacks.

use std::fmt;
use std::io;

/// Invalid configuration detected at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value parsed fine but is outside its allowed range.
    InvalidValue {
        /// Configuration field name.
        field: &'static str,
        /// The rejected value.
        value: u64,
        /// Why the value was rejected.
        reason: &'static str,
    },
    /// A value from the environment could not be parsed.
    Parse {
        /// Environment key that held the value.
        key: String,
        /// The raw text that failed to parse.
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue {
                field,
                value,
                reason,
            } => write!(f, "invalid value {value} for {field}: {reason}"),
            Self::Parse { key, value } => write!(f, "cannot parse {key}={value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Clonable description of the I/O failure that ended a capture loop.
///
/// `io::Error` is not `Clone`, and the fault has to travel through the
/// handoff channel and be inspected by the consumer, so only its kind and
/// rendered message are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFault {
    /// Kind of the original error.
    pub kind: io::ErrorKind,
    /// Rendered message of the original error.
    pub message: String,
}

impl CaptureFault {
    /// Build a fault from the failed read.
    #[must_use]
    pub fn from_io(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CaptureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture read failed ({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for CaptureFault {}

impl From<io::Error> for CaptureFault {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}

impl From<CaptureFault> for io::Error {
    fn from(fault: CaptureFault) -> Self {
        io::Error::new(fault.kind, fault.message)
    }
}

/// Why a capture loop terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// A shutdown was requested by the consumer.
    Shutdown,
    /// The host input stream reached end of file.
    Eof,
    /// The host input stream failed.
    Fault(CaptureFault),
}

impl CloseReason {
    /// Stable string label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Eof => "eof",
            Self::Fault(_) => "fault",
        }
    }

    /// Whether the capture ended because of a fault.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "fault: {fault}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// The receiving end of the handoff channel has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffClosed;

impl fmt::Display for HandoffClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("handoff receiver dropped")
    }
}

impl std::error::Error for HandoffClosed {}
