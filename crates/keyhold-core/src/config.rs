#![forbid(unsafe_code)]

//! Pipeline configuration.
//!
//! Each component has its own config struct with defaults matching the
//! tuned values below. [`PipelineConfig`] aggregates them and can be built
//! from `KEYHOLD_*` environment variables.
//!
//! | Option | Default | Used by |
//! |--------|---------|---------|
//! | `coalesce_window_ms` | 5 | capture |
//! | `delay_warning_ms` | 50 | capture |
//! | `delay_threshold_ms` | 50 | input buffer |
//! | `typing_mode_delay_ms` | 100 | input buffer |
//! | `idle_threshold_ms` | 50 | render scheduler |
//! | `max_defer_ms` | 200 | render scheduler |
//! | `min_render_interval_ms` | 100 | reserved |
//!
//! Values are validated when a component is constructed; invalid values are
//! rejected with [`ConfigError`] rather than clamped.

use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound for any millisecond setting.
pub const MAX_CONFIG_MS: u64 = 60_000;

fn check_ms(field: &'static str, value: u64, allow_zero: bool) -> Result<(), ConfigError> {
    if !allow_zero && value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            value,
            reason: "must be greater than zero",
        });
    }
    if value > MAX_CONFIG_MS {
        return Err(ConfigError::InvalidValue {
            field,
            value,
            reason: "must not exceed 60000ms",
        });
    }
    Ok(())
}

/// Capture source configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Units arriving within this window are handed off as one batch (ms).
    /// Zero hands off every chunk as soon as the capture loop sees it.
    pub coalesce_window_ms: u64,

    /// Gap between successive arrivals, with a batch still pending, that
    /// raises a delay warning (ms).
    pub delay_warning_ms: u64,

    /// Size of the read buffer for the host stream.
    pub read_chunk_size: usize,

    /// Put the terminal in raw mode while capturing.
    pub raw_mode: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 5,
            delay_warning_ms: 50,
            read_chunk_size: 1024,
            raw_mode: true,
        }
    }
}

impl CaptureConfig {
    /// Set the coalescing window.
    #[must_use]
    pub fn with_coalesce_window_ms(mut self, ms: u64) -> Self {
        self.coalesce_window_ms = ms;
        self
    }

    /// Set the delay-warning gap.
    #[must_use]
    pub fn with_delay_warning_ms(mut self, ms: u64) -> Self {
        self.delay_warning_ms = ms;
        self
    }

    /// Set the read buffer size.
    #[must_use]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Enable or disable raw mode.
    #[must_use]
    pub fn with_raw_mode(mut self, enabled: bool) -> Self {
        self.raw_mode = enabled;
        self
    }

    /// Coalescing window as a duration.
    #[must_use]
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    /// Delay-warning gap as a duration.
    #[must_use]
    pub fn delay_warning(&self) -> Duration {
        Duration::from_millis(self.delay_warning_ms)
    }

    /// Check all values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ms("coalesce_window_ms", self.coalesce_window_ms, true)?;
        check_ms("delay_warning_ms", self.delay_warning_ms, true)?;
        if self.read_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "read_chunk_size",
                value: 0,
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

/// Input buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Time between flushes above which a non-empty flush counts as a delay
    /// event (ms).
    pub delay_threshold_ms: u64,

    /// Quiet period after the last push before typing mode turns off (ms).
    pub typing_mode_delay_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            delay_threshold_ms: 50,
            typing_mode_delay_ms: 100,
        }
    }
}

impl BufferConfig {
    /// Set the delay threshold.
    #[must_use]
    pub fn with_delay_threshold_ms(mut self, ms: u64) -> Self {
        self.delay_threshold_ms = ms;
        self
    }

    /// Set the typing-mode quiet period.
    #[must_use]
    pub fn with_typing_mode_delay_ms(mut self, ms: u64) -> Self {
        self.typing_mode_delay_ms = ms;
        self
    }

    /// Delay threshold as a duration.
    #[must_use]
    pub fn delay_threshold(&self) -> Duration {
        Duration::from_millis(self.delay_threshold_ms)
    }

    /// Typing-mode quiet period as a duration.
    #[must_use]
    pub fn typing_mode_delay(&self) -> Duration {
        Duration::from_millis(self.typing_mode_delay_ms)
    }

    /// Check all values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ms("delay_threshold_ms", self.delay_threshold_ms, true)?;
        check_ms("typing_mode_delay_ms", self.typing_mode_delay_ms, false)
    }
}

/// Render scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Quiet period after the last input before the scheduler goes idle (ms).
    pub idle_threshold_ms: u64,

    /// Upper bound on how long deferred work may wait (ms).
    pub max_defer_ms: u64,

    /// Reserved for render throttling; stored and reported, not enforced.
    pub min_render_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 50,
            max_defer_ms: 200,
            min_render_interval_ms: 100,
        }
    }
}

impl SchedulerConfig {
    /// Set the idle threshold.
    #[must_use]
    pub fn with_idle_threshold_ms(mut self, ms: u64) -> Self {
        self.idle_threshold_ms = ms;
        self
    }

    /// Set the maximum defer time.
    #[must_use]
    pub fn with_max_defer_ms(mut self, ms: u64) -> Self {
        self.max_defer_ms = ms;
        self
    }

    /// Set the reserved minimum render interval.
    #[must_use]
    pub fn with_min_render_interval_ms(mut self, ms: u64) -> Self {
        self.min_render_interval_ms = ms;
        self
    }

    /// Idle threshold as a duration.
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    /// Maximum defer time as a duration.
    #[must_use]
    pub fn max_defer(&self) -> Duration {
        Duration::from_millis(self.max_defer_ms)
    }

    /// Check all values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ms("idle_threshold_ms", self.idle_threshold_ms, false)?;
        check_ms("max_defer_ms", self.max_defer_ms, false)?;
        check_ms("min_render_interval_ms", self.min_render_interval_ms, true)
    }
}

/// Configuration for a whole capture → buffer → scheduler pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Capture source settings.
    pub capture: CaptureConfig,
    /// Input buffer settings.
    pub buffer: BufferConfig,
    /// Render scheduler settings.
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    /// Replace the capture settings.
    #[must_use]
    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    /// Replace the buffer settings.
    #[must_use]
    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    /// Replace the scheduler settings.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Check every component's values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture.validate()?;
        self.buffer.validate()?;
        self.scheduler.validate()
    }

    /// Build from `KEYHOLD_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup on top of the defaults.
    ///
    /// Recognized keys: `KEYHOLD_COALESCE_WINDOW_MS`,
    /// `KEYHOLD_DELAY_WARNING_MS`, `KEYHOLD_DELAY_THRESHOLD_MS`,
    /// `KEYHOLD_TYPING_MODE_DELAY_MS`, `KEYHOLD_IDLE_THRESHOLD_MS`,
    /// `KEYHOLD_MAX_DEFER_MS`, `KEYHOLD_MIN_RENDER_INTERVAL_MS`,
    /// `KEYHOLD_RAW_MODE`. The result is validated before it is returned.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let ms = |key: &str, slot: &mut u64| -> Result<(), ConfigError> {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|_| ConfigError::Parse {
                    key: key.to_string(),
                    value: raw.clone(),
                })?;
            }
            Ok(())
        };

        ms(
            "KEYHOLD_COALESCE_WINDOW_MS",
            &mut config.capture.coalesce_window_ms,
        )?;
        ms(
            "KEYHOLD_DELAY_WARNING_MS",
            &mut config.capture.delay_warning_ms,
        )?;
        ms(
            "KEYHOLD_DELAY_THRESHOLD_MS",
            &mut config.buffer.delay_threshold_ms,
        )?;
        ms(
            "KEYHOLD_TYPING_MODE_DELAY_MS",
            &mut config.buffer.typing_mode_delay_ms,
        )?;
        ms(
            "KEYHOLD_IDLE_THRESHOLD_MS",
            &mut config.scheduler.idle_threshold_ms,
        )?;
        ms("KEYHOLD_MAX_DEFER_MS", &mut config.scheduler.max_defer_ms)?;
        ms(
            "KEYHOLD_MIN_RENDER_INTERVAL_MS",
            &mut config.scheduler.min_render_interval_ms,
        )?;

        if let Some(raw) = lookup("KEYHOLD_RAW_MODE") {
            config.capture.raw_mode = match raw.trim() {
                "1" => true,
                "0" => false,
                v if v.eq_ignore_ascii_case("true") => true,
                v if v.eq_ignore_ascii_case("false") => false,
                _ => {
                    return Err(ConfigError::Parse {
                        key: "KEYHOLD_RAW_MODE".to_string(),
                        value: raw.clone(),
                    });
                }
            };
        }

        config.validate()?;
        Ok(config)
    }
}
