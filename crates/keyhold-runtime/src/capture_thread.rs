#![forbid(unsafe_code)]

//! The capture execution context.
//!
//! Two named threads sit between the host stream and the handoff channel:
//!
//! - `keyhold-capture-read` performs the only blocking read in the
//!   pipeline. It stamps each chunk with `Instant::now()` the moment the OS
//!   delivers it and forwards it to the batching thread.
//! - `keyhold-capture` owns the [`CaptureSource`] state machine. It waits
//!   for chunks no longer than the coalescing deadline, so a pending batch
//!   is handed off on time even while the reader is blocked.
//!
//! Neither thread shares a lock with the consumer; the handoff channel is
//! the single synchronization point.
//!
//! # Shutdown
//!
//! [`CaptureHandle::shutdown`] (also run on drop) tells the batching thread
//! to stop. It performs a final synchronous flush, sends
//! [`CaptureMessage::Closed`], restores the terminal, and is joined. A read
//! already blocked in the OS cannot be interrupted: the reader thread is
//! detached and exits on its next wake-up.

use std::fmt;
use std::io::{self, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use keyhold_core::capture::CaptureSource;
use keyhold_core::config::CaptureConfig;
use keyhold_core::error::{CaptureFault, CloseReason, ConfigError};
use keyhold_core::handoff::{self, CaptureMessage, HandoffReceiver, HandoffSender};
#[cfg(not(target_arch = "wasm32"))]
use keyhold_core::terminal_session::TerminalSession;

use crate::debug_trace;

/// Why the capture threads could not be started.
#[derive(Debug)]
pub enum SpawnError {
    /// The capture configuration is invalid.
    Config(ConfigError),
    /// Raw mode or thread creation failed.
    Io(io::Error),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid capture config: {err}"),
            Self::Io(err) => write!(f, "cannot start capture: {err}"),
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

impl From<ConfigError> for SpawnError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<io::Error> for SpawnError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

enum CaptureInput {
    Chunk(Vec<u8>, Instant),
    Eof,
    Fault(CaptureFault),
    Shutdown,
}

/// Owner of the running capture threads.
#[derive(Debug)]
pub struct CaptureHandle {
    control: mpsc::Sender<CaptureInput>,
    batcher: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl fmt::Debug for CaptureInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunk(bytes, _) => write!(f, "Chunk({} bytes)", bytes.len()),
            Self::Eof => f.write_str("Eof"),
            Self::Fault(fault) => write!(f, "Fault({fault})"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl CaptureHandle {
    /// Whether the batching thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.batcher.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop capturing: final flush, `Closed`, terminal restored.
    ///
    /// Idempotent. Blocks until the batching thread has exited.
    pub fn shutdown(&mut self) {
        if let Some(batcher) = self.batcher.take() {
            let _ = self.control.send(CaptureInput::Shutdown);
            let _ = batcher.join();
            tracing::debug!("capture thread joined");
        }
        if let Some(reader) = self.reader.take() {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start capturing from `reader`.
///
/// Returns the handle controlling the capture threads and the receiving end
/// of the handoff channel. The first message is always
/// [`CaptureMessage::Ready`] and the last is [`CaptureMessage::Closed`].
///
/// # Errors
///
/// Fails if the configuration is invalid, raw mode cannot be entered (when
/// `config.raw_mode` is set), or a thread cannot be spawned.
pub fn spawn_capture<R>(
    reader: R,
    config: CaptureConfig,
) -> Result<(CaptureHandle, HandoffReceiver), SpawnError>
where
    R: Read + Send + 'static,
{
    config.validate()?;

    #[cfg(not(target_arch = "wasm32"))]
    let session = if config.raw_mode {
        Some(TerminalSession::enter()?)
    } else {
        None
    };

    let (tx, rx) = handoff::channel();
    let (control, inputs) = mpsc::channel();
    let chunk_size = config.read_chunk_size;

    let batcher = thread::Builder::new()
        .name("keyhold-capture".into())
        .spawn(move || {
            #[cfg(not(target_arch = "wasm32"))]
            let _session = session;
            batch_loop(config, inputs, tx);
        })?;

    let reader_control = control.clone();
    let reader = match thread::Builder::new()
        .name("keyhold-capture-read".into())
        .spawn(move || read_loop(reader, chunk_size, reader_control))
    {
        Ok(handle) => handle,
        Err(err) => {
            let _ = control.send(CaptureInput::Shutdown);
            let _ = batcher.join();
            return Err(err.into());
        }
    };

    Ok((
        CaptureHandle {
            control,
            batcher: Some(batcher),
            reader: Some(reader),
        },
        rx,
    ))
}

/// Start capturing from the process's standard input.
///
/// # Errors
///
/// See [`spawn_capture`].
pub fn spawn_stdin_capture(
    config: CaptureConfig,
) -> Result<(CaptureHandle, HandoffReceiver), SpawnError> {
    spawn_capture(io::stdin(), config)
}

fn read_loop<R: Read>(mut reader: R, chunk_size: usize, out: mpsc::Sender<CaptureInput>) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        let input = match reader.read(&mut buf) {
            Ok(0) => CaptureInput::Eof,
            Ok(n) => CaptureInput::Chunk(buf[..n].to_vec(), Instant::now()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => CaptureInput::Fault(CaptureFault::from_io(&err)),
        };
        let last = !matches!(input, CaptureInput::Chunk(..));
        debug_trace!("capture read: {input:?}");
        if out.send(input).is_err() || last {
            return;
        }
    }
}

fn batch_loop(config: CaptureConfig, inputs: mpsc::Receiver<CaptureInput>, mut tx: HandoffSender) {
    let mut source = CaptureSource::new(config);
    if tx.send(CaptureMessage::Ready).is_err() {
        return;
    }
    tracing::debug!("capture ready");

    let reason = loop {
        let input = match source.time_until_flush(Instant::now()) {
            Some(wait) => match inputs.recv_timeout(wait) {
                Ok(input) => Some(input),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(CaptureInput::Shutdown),
            },
            None => Some(inputs.recv().unwrap_or(CaptureInput::Shutdown)),
        };

        match input {
            Some(CaptureInput::Chunk(bytes, arrived_at)) => {
                if let Some(warning) = source.ingest_at(&bytes, arrived_at) {
                    tracing::warn!(
                        gap_ms = warning.gap.as_millis() as u64,
                        buffered = warning.buffered_count,
                        "capture arrival gap exceeded threshold"
                    );
                    if tx.send(CaptureMessage::DelayWarning(warning)).is_err() {
                        break CloseReason::Shutdown;
                    }
                }
            }
            Some(CaptureInput::Eof) => break CloseReason::Eof,
            Some(CaptureInput::Fault(fault)) => break CloseReason::Fault(fault),
            Some(CaptureInput::Shutdown) => break CloseReason::Shutdown,
            None => {}
        }

        if let Some(batch) = source.tick_at(Instant::now()) {
            debug_trace!("batch seq={} units={}", batch.seq, batch.len());
            if tx.send(CaptureMessage::Batch(batch)).is_err() {
                break CloseReason::Shutdown;
            }
        }
    };

    if let Some(batch) = source.finish_at(Instant::now()) {
        let _ = tx.send(CaptureMessage::Batch(batch));
    }
    let stats = source.stats();
    tracing::debug!(
        reason = reason.as_str(),
        chunks = stats.chunks,
        batches = stats.batches,
        "capture closed"
    );
    let _ = tx.send(CaptureMessage::Closed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CaptureConfig {
        CaptureConfig::default().with_raw_mode(false)
    }

    fn drain(rx: &mut HandoffReceiver) -> Vec<CaptureMessage> {
        let mut out = Vec::new();
        while let Some(msg) = rx.recv() {
            let closed = matches!(msg, CaptureMessage::Closed(_));
            out.push(msg);
            if closed {
                break;
            }
        }
        out
    }

    #[test]
    fn eof_reader_yields_ready_batch_closed() {
        let (mut handle, mut rx) = spawn_capture(&b"hello"[..], config()).unwrap();
        let messages = drain(&mut rx);
        handle.shutdown();

        assert_eq!(messages.first(), Some(&CaptureMessage::Ready));
        assert_eq!(
            messages.last(),
            Some(&CaptureMessage::Closed(CloseReason::Eof))
        );
        let content: Vec<u8> = messages
            .iter()
            .filter_map(|m| match m {
                CaptureMessage::Batch(b) => Some(b.content()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(content, b"hello");
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "host went away"))
        }
    }

    #[test]
    fn read_error_closes_with_fault() {
        let (_handle, mut rx) = spawn_capture(FailingReader, config()).unwrap();
        let messages = drain(&mut rx);
        match messages.last() {
            Some(CaptureMessage::Closed(CloseReason::Fault(fault))) => {
                assert_eq!(fault.kind, io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct InterruptOnce(bool);

    impl Read for InterruptOnce {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            if !self.0 {
                self.0 = true;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            Ok(0)
        }
    }

    #[test]
    fn interrupted_read_is_retried() {
        let (_handle, mut rx) = spawn_capture(InterruptOnce(false), config()).unwrap();
        let messages = drain(&mut rx);
        assert_eq!(
            messages,
            vec![
                CaptureMessage::Ready,
                CaptureMessage::Closed(CloseReason::Eof)
            ]
        );
    }

    /// Reader that blocks until the test hangs up.
    struct Blocking(mpsc::Receiver<Vec<u8>>);

    impl Read for Blocking {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    #[test]
    fn shutdown_flushes_pending_batch() {
        let (feed, source) = mpsc::channel();
        let long_window = config().with_coalesce_window_ms(10_000);
        let (mut handle, mut rx) = spawn_capture(Blocking(source), long_window).unwrap();
        assert_eq!(rx.recv(), Some(CaptureMessage::Ready));

        feed.send(b"xyz".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        handle.shutdown();
        assert!(!handle.is_running());

        let messages = drain(&mut rx);
        match messages.as_slice() {
            [CaptureMessage::Batch(batch), CaptureMessage::Closed(CloseReason::Shutdown)] => {
                assert_eq!(batch.content(), b"xyz");
            }
            other => panic!("unexpected {other:?}"),
        }
        drop(feed);
    }

    #[test]
    fn invalid_config_rejected() {
        let bad = config().with_read_chunk_size(0);
        assert!(matches!(
            spawn_capture(io::empty(), bad),
            Err(SpawnError::Config(_))
        ));
    }
}
