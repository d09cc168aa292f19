//! Exponential backoff policy for workpool retries
//! (`initialBackoffMs`, `base`, `maxAttempts`).

use std::time::Duration;

/// `delay = initialBackoffMs * base^attempt`, capped at `max_backoff_ms`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub base: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            base: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::workpool::WorkpoolConfig) -> Self {
        Self {
            max_attempts: config.default_max_attempts,
            initial_backoff_ms: config.default_initial_backoff_ms,
            base: config.default_backoff_base,
            max_backoff_ms: config.max_backoff_ms,
        }
    }

    /// Delay before the attempt that follows a failed `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = self.base.powi(attempt.min(32) as i32);
        let ms = (self.initial_backoff_ms as f64 * exponent) as u64;
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    /// A `backon::ExponentialBuilder` configured to match this policy, for
    /// call sites (process manager / saga retries) that prefer the
    /// `backon` iterator style used elsewhere in the orchestration layer.
    pub fn to_backon(&self) -> backon::ExponentialBuilder {
        backon::ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_factor(self.base as f32)
            .with_max_times(self.max_attempts as usize)
    }
}
