//! Exponential backoff policy.

use std::time::Duration;

use crate::types::ResilienceConfig;

/// Largest exponent applied to the base delay; later attempts reuse it.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Retry budget and backoff schedule for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_delay)
    }

    /// Whether another retry is allowed after `attempts_so_far` failures.
    pub fn should_retry(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}
