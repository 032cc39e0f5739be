//! Background maintenance for long-running workers.
//!
//! `SweepService` periodically drops rate-limit windows that have already
//! closed, so keys that stop sending requests do not accumulate forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::rate_limiter::RateLimiter;
use crate::types::RateLimitConfig;

/// Statistics from one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepStats {
    /// Expired windows removed
    pub windows_removed: usize,
    /// Keys still tracked afterwards
    pub keys_remaining: usize,
    /// When the cycle completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// Periodic sweep of expired rate-limit windows.
#[derive(Debug)]
pub struct SweepService {
    limiter: Arc<Mutex<RateLimiter>>,
    interval: Duration,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl SweepService {
    pub fn new(limiter: Arc<Mutex<RateLimiter>>, config: &RateLimitConfig) -> Self {
        Self {
            limiter,
            interval: config.sweep_interval,
            stop_tx: None,
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; sweeps run in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let limiter = self.limiter.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);
        let mut ticker = interval(self.interval);

        tokio::spawn(async move {
            // The first tick completes immediately; nothing can have expired yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_sweep_cycle(&limiter).await;
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("sweep_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single sweep cycle.
    pub async fn run_sweep_cycle(limiter: &Arc<Mutex<RateLimiter>>) -> SweepStats {
        let mut limiter = limiter.lock().await;
        let windows_removed = limiter.cleanup_expired();
        let stats = SweepStats {
            windows_removed,
            keys_remaining: limiter.tracked_keys(),
            completed_at: Some(Utc::now()),
        };

        tracing::debug!(
            windows_removed = stats.windows_removed,
            keys_remaining = stats.keys_remaining,
            "sweep_cycle_completed"
        );
        stats
    }
}

impl Drop for SweepService {
    fn drop(&mut self) {
        self.stop();
    }
}
