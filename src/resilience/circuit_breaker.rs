//! Circuit breaker for one operation context.
//!
//! Three states:
//! - Closed: normal operation, requests pass through
//! - Open: requests are rejected until the reset timeout elapses
//! - HalfOpen: a single trial request is admitted
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(reset timeout)--> HALF_OPEN
//!    ^                                  ^                          |
//!    |                                  +-------(failure)----------+
//!    +------------------(any success)----------------------------+
//! ```
//!
//! The failure count is only cleared by a success, so a failed half-open
//! trial re-opens the breaker immediately. A trial that never reports back
//! (cancelled or panicked) holds the half-open slot for at most one reset
//! timeout.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::CircuitBreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-context failure tracker.
///
/// NOT shared across processes: each worker trips its own breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
    /// When the outstanding half-open trial was admitted.
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout,
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
            trial_started: None,
        }
    }

    /// Whether a request may be dispatched now.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open and
    /// admits this one call as the trial. Further calls are refused until the
    /// trial's outcome is recorded, the trial is released, or the trial has
    /// been outstanding for a full reset timeout.
    pub fn can_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started = Some(Instant::now());
                    tracing::info!(failures = self.failure_count, "circuit_half_open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match self.trial_started {
                Some(at) if at.elapsed() < self.reset_timeout => false,
                stale => {
                    if stale.is_some() {
                        tracing::warn!(
                            reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                            "circuit_trial_expired"
                        );
                    }
                    self.trial_started = Some(Instant::now());
                    true
                }
            },
        }
    }

    /// Give up the outstanding half-open trial without an outcome.
    ///
    /// The breaker stays half-open and the next call becomes the trial.
    pub fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen && self.trial_started.take().is_some() {
            tracing::debug!("circuit_trial_released");
        }
    }

    /// Record a successful call: always closes the breaker.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!(previous = ?self.state, "circuit_closed");
        }
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.trial_started = None;
    }

    /// Record a failed call. Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());
        self.trial_started = None;

        if self.failure_count >= self.failure_threshold && self.state != CircuitState::Open {
            self.state = CircuitState::Open;
            tracing::warn!(
                failures = self.failure_count,
                threshold = self.failure_threshold,
                "circuit_opened"
            );
            return true;
        }
        false
    }

    /// Apply new thresholds; counters and state are kept.
    pub fn reconfigure(&mut self, config: &CircuitBreakerConfig) {
        self.failure_threshold = config.failure_threshold.max(1);
        self.reset_timeout = config.reset_timeout;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Time left before an open breaker admits its trial.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let at = self.last_failure?;
        Some(self.reset_timeout.saturating_sub(at.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        })
    }

    #[test]
    fn test_starts_closed() {
        let mut cb = breaker(3, 1000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_request());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut cb = breaker(3, 1000);
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert!(cb.can_request());
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_then_reopen() {
        let mut cb = breaker(2, 1000);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.can_request());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.can_request());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cb.can_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Only one trial is admitted.
        assert!(!cb.can_request());

        // A failed trial re-opens immediately.
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let mut cb = breaker(1, 100);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cb.can_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.can_request());
        assert!(cb.can_request());
    }

    #[test]
    fn test_success_resets_from_open() {
        let mut cb = breaker(1, 60_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_remaining() {
        let mut cb = breaker(1, 1000);
        assert_eq!(cb.cooldown_remaining(), None);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(cb.cooldown_remaining(), Some(Duration::from_millis(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_expires_after_reset_timeout() {
        let mut cb = breaker(1, 1000);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(cb.can_request());

        // The trial never reports back.
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.can_request());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.can_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_trial_admits_next_call() {
        let mut cb = breaker(1, 1000);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(cb.can_request());
        assert!(!cb.can_request());

        cb.release_trial();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_request());
        assert!(!cb.can_request());
    }

    #[test]
    fn test_release_trial_ignored_when_closed() {
        let mut cb = breaker(3, 1000);
        cb.release_trial();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_request());
    }

    #[test]
    fn test_reconfigure_keeps_counters() {
        let mut cb = breaker(5, 1000);
        cb.record_failure();
        cb.record_failure();
        cb.reconfigure(&CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(10),
        });
        assert_eq!(cb.failure_count(), 2);
        assert!(cb.record_failure());
    }
}
