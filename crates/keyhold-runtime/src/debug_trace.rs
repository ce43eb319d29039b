#![forbid(unsafe_code)]

//! Env-gated stderr trace of the capture threads and the pipeline.
//!
//! Set `KEYHOLD_DEBUG_TRACE=1` to follow one keystroke across threads. Each
//! line carries the milliseconds since the first trace and the name of the
//! emitting thread, so the reader (`keyhold-capture-read`), the batcher
//! (`keyhold-capture`), and the consumer interleave readably:
//!
//! ```text
//! [keyhold      12ms keyhold-capture-read] capture read: Chunk(3 bytes)
//! [keyhold      17ms keyhold-capture     ] batch seq=0 units=3
//! [keyhold      17ms main                ] pipeline batch seq=0 units=3
//! ```
//!
//! It does not depend on a `tracing` subscriber. When disabled, each call
//! site costs one static bool load and formats nothing.

use std::fmt;
use std::sync::LazyLock;
use std::time::Instant;

/// Environment variable that enables the trace.
pub const DEBUG_TRACE_ENV: &str = "KEYHOLD_DEBUG_TRACE";

/// Width the thread column is padded to; the longest capture thread name.
const THREAD_COLUMN: usize = "keyhold-capture-read".len();

static DEBUG_TRACE_ENABLED: LazyLock<bool> = LazyLock::new(|| {
    std::env::var(DEBUG_TRACE_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

static START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Whether debug tracing is enabled.
#[inline]
pub fn is_enabled() -> bool {
    *DEBUG_TRACE_ENABLED
}

/// Milliseconds since the first trace call.
#[inline]
pub fn elapsed_ms() -> u64 {
    START_TIME.elapsed().as_millis() as u64
}

/// Name of the current thread, or `unnamed`.
pub fn thread_label() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_owned()
}

fn format_line(elapsed_ms: u64, thread: &str, args: fmt::Arguments<'_>) -> String {
    format!("[keyhold {elapsed_ms:>7}ms {thread:<width$}] {args}", width = THREAD_COLUMN)
}

#[doc(hidden)]
pub fn emit(args: fmt::Arguments<'_>) {
    eprintln!("{}", format_line(elapsed_ms(), &thread_label(), args));
}

/// Print a timestamped, thread-tagged line to stderr when
/// `KEYHOLD_DEBUG_TRACE=1`.
#[macro_export]
macro_rules! debug_trace {
    ($($arg:tt)*) => {
        if $crate::debug_trace::is_enabled() {
            $crate::debug_trace::emit(format_args!($($arg)*));
        }
    };
}
