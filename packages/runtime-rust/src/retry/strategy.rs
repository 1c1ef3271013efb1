//! Retry decision policies.
//!
//! The delay for attempt `n` is `delay × multiplier^n`, clamped to
//! `max_delay` when one is set. Attempts are 0-indexed: attempt `0` is the
//! first redelivery and waits exactly `delay`.

use std::fmt;
use std::time::Duration;

use crate::config::RetryConfig;

/// Decides whether, and after how long, a failed message is redelivered.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Returns the wait before redelivery `attempt`, or `None` to give up.
    fn should_retry(&self, attempt: u32) -> Option<Duration>;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplierRetryStrategy {
    max_retries: u32,
    delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl MultiplierRetryStrategy {
    /// A `max_delay` of zero leaves delays uncapped.
    #[must_use]
    pub fn new(max_retries: u32, delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            multiplier,
            max_delay,
        }
    }

    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.delay(),
            config.multiplier,
            config.max_delay(),
        )
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.delay.as_nanos() as f64 * self.multiplier.powi(exp);

        let delay = if nanos.is_finite() && nanos >= 0.0 && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        };

        if self.max_delay.is_zero() {
            delay
        } else {
            delay.min(self.max_delay)
        }
    }
}

impl Default for MultiplierRetryStrategy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryStrategy for MultiplierRetryStrategy {
    fn should_retry(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.backoff(attempt))
    }
}
