#![forbid(unsafe_code)]

//! Host stream configuration guard.
//!
//! Capture wants the terminal in raw, unbuffered mode so every keystroke is
//! delivered as soon as it is typed, without line editing or echo.
//! [`TerminalSession`] puts it there and restores it on every exit path.
//!
//! # Lifecycle Guarantees
//!
//! 1. **Only what we changed is undone** - If raw mode was already on when
//!    the session started, the session leaves it on when it ends.
//!
//! 2. **Drop restores previous state** - Dropping the session disables raw
//!    mode (if this session enabled it) and flushes stdout.
//!
//! 3. **Panic safety** - A one-time panic hook restores the terminal before
//!    the previous hook prints the panic message.
//!
//! 4. **Termination signals** - On Unix, SIGINT and SIGTERM restore the
//!    terminal and exit with `128 + signal`.
//!
//! # Usage
//!
//! ```no_run
//! use keyhold_core::terminal_session::TerminalSession;
//!
//! let session = TerminalSession::enter()?;
//! // stdin now delivers keystrokes unbuffered
//! drop(session);
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io::{self, Write};
use std::sync::OnceLock;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::iterator::Signals;

/// RAII guard for raw-mode capture on the controlling terminal.
///
/// The guard is `Send` so the capture thread can own it for exactly as long
/// as it reads from the terminal.
#[derive(Debug)]
pub struct TerminalSession {
    raw_mode_enabled: bool,
    #[cfg(unix)]
    signal_guard: Option<SignalGuard>,
}

impl TerminalSession {
    /// Enter raw mode unless it is already active.
    ///
    /// # Errors
    ///
    /// Returns an error if raw mode state cannot be queried or changed, or
    /// if the signal watcher cannot be registered.
    pub fn enter() -> io::Result<Self> {
        install_panic_hook();

        #[cfg(unix)]
        let (signal_guard, raw_mode_enabled) = arm_then_enable(
            SignalGuard::new,
            crossterm::terminal::is_raw_mode_enabled,
            crossterm::terminal::enable_raw_mode,
        )?;
        #[cfg(not(unix))]
        let ((), raw_mode_enabled) = arm_then_enable(
            || Ok(()),
            crossterm::terminal::is_raw_mode_enabled,
            crossterm::terminal::enable_raw_mode,
        )?;
        if raw_mode_enabled {
            crate::info!("terminal raw mode enabled");
        }

        Ok(Self {
            raw_mode_enabled,
            #[cfg(unix)]
            signal_guard: Some(signal_guard),
        })
    }

    /// Whether this session switched the terminal into raw mode.
    #[must_use]
    pub fn owns_raw_mode(&self) -> bool {
        self.raw_mode_enabled
    }

    fn cleanup(&mut self) {
        #[cfg(unix)]
        let _ = self.signal_guard.take();

        if self.raw_mode_enabled {
            let _ = crossterm::terminal::disable_raw_mode();
            self.raw_mode_enabled = false;
            crate::info!("terminal raw mode disabled");
        }

        let _ = io::stdout().flush();
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn install_panic_hook() {
    static HOOK: OnceLock<()> = OnceLock::new();
    HOOK.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            best_effort_cleanup();
            previous(info);
        }));
    });
}

/// Run every fallible setup step before switching the terminal.
///
/// Raw mode is the last step, so an error never leaves it enabled without a
/// session to undo it. Returns the guard and whether raw mode was switched on.
fn arm_then_enable<G>(
    arm: impl FnOnce() -> io::Result<G>,
    is_raw: impl FnOnce() -> io::Result<bool>,
    enable: impl FnOnce() -> io::Result<()>,
) -> io::Result<(G, bool)> {
    let guard = arm()?;
    let already_raw = is_raw()?;
    if !already_raw {
        enable()?;
    }
    Ok((guard, !already_raw))
}

fn best_effort_cleanup() {
    let _ = crossterm::terminal::disable_raw_mode();
    let _ = io::stdout().flush();
}

#[cfg(unix)]
#[derive(Debug)]
struct SignalGuard {
    handle: signal_hook::iterator::Handle,
    thread: Option<std::thread::JoinHandle<()>>,
}

#[cfg(unix)]
impl SignalGuard {
    fn new() -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let thread = std::thread::Builder::new()
            .name("keyhold-signals".into())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    crate::warn!(signal, "termination signal received, restoring terminal");
                    best_effort_cleanup();
                    std::process::exit(128 + signal);
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

#[cfg(unix)]
impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
