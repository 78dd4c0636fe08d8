//! Linear backoff for repeated connection attempts
//!
//! Every connect attempt increments the instance's retry count. Once the
//! count passes a threshold, the next attempt first waits
//! `min(retry_count * step, max_delay)`. Below the threshold attempts go
//! out immediately.

use std::time::Duration;

/// Configuration for linear backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay added per prior attempt
    pub step: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Attempts allowed before delays kick in
    pub apply_after_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            apply_after_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinearBackoff {
    config: BackoffConfig,
}

impl LinearBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay for a given retry count, capped at `max_delay`
    pub fn compute_backoff_delay(&self, retry_count: u32) -> Duration {
        self.config
            .step
            .saturating_mul(retry_count)
            .min(self.config.max_delay)
    }

    /// Delay to wait before the next attempt, if any.
    ///
    /// `retry_count` is the count before the attempt is recorded.
    pub fn delay_before_attempt(&self, retry_count: u32) -> Option<Duration> {
        if retry_count > self.config.apply_after_retries {
            Some(self.compute_backoff_delay(retry_count))
        } else {
            None
        }
    }
}
