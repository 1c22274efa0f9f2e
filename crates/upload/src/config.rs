//! Upload configuration.

use std::time::Duration;

use objput_transfer::DEFAULT_PART_SIZE;

use crate::error::UploadError;

/// Default number of parts uploaded at once.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default number of retries after a transient failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What to do with a multipart session that will never be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbandonPolicy {
    /// Abort the session on the store so stored parts are discarded.
    #[default]
    Abort,
    /// Leave the session and its parts on the store.
    Keep,
}

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculates the delay before retry `attempt` (1-based), with ±25%
    /// jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Duration::from_secs_f64(with_jitter(capped, jitter_unit(nanos)))
    }
}

/// Maps the sub-second nanoseconds of a clock reading onto `[0.0, 1.0)`.
fn jitter_unit(subsec_nanos: u32) -> f64 {
    subsec_nanos as f64 / 1_000_000_000.0
}

/// Spreads `secs` over `[0.75 * secs, 1.25 * secs)` by `unit` in `[0.0, 1.0)`.
fn with_jitter(secs: f64, unit: f64) -> f64 {
    let offset = unit * 2.0 - 1.0;
    (secs + secs * 0.25 * offset).max(0.0)
}

/// Settings for one [`UploadOrchestrator`](crate::UploadOrchestrator).
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Files up to this size (inclusive) are sent in a single request.
    pub threshold: u64,
    /// Size of every multipart part except the last.
    pub part_size: u64,
    /// Parts uploaded at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub abandon: AbandonPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_PART_SIZE,
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            abandon: AbandonPolicy::default(),
        }
    }
}

impl UploadConfig {
    /// Checks that the settings can drive an upload.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.threshold == 0 {
            return Err(UploadError::Config("threshold must be positive".into()));
        }
        if self.part_size == 0 {
            return Err(UploadError::Config("part size must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(UploadError::Config("concurrency must be at least 1".into()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(UploadError::Config(
                "retry backoff factor must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
