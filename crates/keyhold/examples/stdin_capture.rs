#![forbid(unsafe_code)]

//! Interactive capture demo.
//!
//! Puts the terminal in raw mode, echoes keystrokes immediately, and runs a
//! slow "status line" render at low priority that waits while you type.
//! Press `q` or Ctrl-C to quit; metrics are printed on exit.
//!
//! Run with:
//!   KEYHOLD_LOG=keyhold_runtime=debug \
//!   cargo run -p keyhold --example stdin_capture --features tracing-json 2>log.json

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use keyhold::prelude::*;

const CTRL_C: u8 = 0x03;

fn main() -> keyhold::Result<()> {
    keyhold::core::logging::init_json_subscriber();

    let mut pipeline: Pipeline = Pipeline::spawn_stdin(PipelineConfig::from_env()?)?;
    let mut frames = 0u64;

    'main: while !pipeline.is_closed() {
        let report = pipeline.pump(Duration::from_millis(16))?;
        if report.batches > 0 {
            let input = pipeline.buffer_mut().flush();
            if input.content.iter().any(|&b| b == b'q' || b == CTRL_C) {
                break 'main;
            }
            let echo = input.text().into_owned();
            pipeline.request_render(
                move || {
                    let mut out = io::stdout().lock();
                    write!(out, "{}", echo.replace('\r', "\r\n"))?;
                    out.flush()
                },
                RenderPriority::High,
            )?;
        }

        frames += 1;
        if frames % 30 == 0 && pipeline.scheduler().deferred_len() == 0 {
            pipeline.request_render(
                move || {
                    // Stand-in for an expensive full-screen redraw.
                    thread::sleep(Duration::from_millis(40));
                    let mut out = io::stdout().lock();
                    write!(out, "\x1b7\x1b[1;1H[frame {frames}]\x1b8")?;
                    out.flush()
                },
                RenderPriority::Low,
            )?;
        }
    }

    pipeline.shutdown();
    let closed = pipeline.close_reason().cloned();
    let buffer = pipeline.buffer().metrics();
    let render = pipeline.scheduler().metrics();
    drop(pipeline);

    if let Some(err) = closed.as_ref().and_then(keyhold::Error::from_close) {
        return Err(err);
    }
    eprintln!(
        "inputs={} delay_events={} max_delay={:?} renders={} deferred={} immediate={}",
        buffer.total_inputs,
        buffer.delay_events,
        buffer.max_delay,
        render.total_renders,
        render.deferred_renders,
        render.immediate_renders,
    );
    Ok(())
}
