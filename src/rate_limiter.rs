//! Rate limiting and throttling.
//!
//! Fixed-window admission control per caller key (IP, API key, ...). Each key
//! owns one counter and the instant its window opened. A burst straddling two
//! windows can admit up to `2 * max_requests` in quick succession; the
//! trade-off buys O(1) memory and work per key.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::RateLimitConfig;

/// Counter for one key within its current window.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

impl WindowEntry {
    fn fresh(now: Instant) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now >= self.window_start + window
    }
}

/// Rate limiter - fixed-window request counter per key.
///
/// NOT a separate actor - owned by its caller and called via &mut self.
/// Entries for idle keys stay until [`RateLimiter::cleanup_expired`],
/// [`RateLimiter::clear_limit`] or [`RateLimiter::clear_all`] removes them.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    entries: HashMap<String, WindowEntry>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(config.max_requests, config.window_seconds)
    }

    pub fn with_limits(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_seconds),
            entries: HashMap::new(),
        }
    }

    /// Count a request for `key` and report whether it is admitted.
    pub fn check_limit(&mut self, key: &str) -> bool {
        let now = Instant::now();

        match self.entries.get_mut(key) {
            None => {
                self.entries.insert(key.to_string(), WindowEntry::fresh(now));
                true
            }
            Some(entry) if entry.is_expired(now, self.window) => {
                *entry = WindowEntry::fresh(now);
                true
            }
            Some(entry) => {
                entry.count = entry.count.saturating_add(1);
                let allowed = entry.count <= self.max_requests;
                if !allowed {
                    tracing::debug!(
                        key = key,
                        count = entry.count,
                        max = self.max_requests,
                        "rate_limit_denied"
                    );
                }
                allowed
            }
        }
    }

    /// Requests still admissible for `key` in its current window.
    pub fn remaining_requests(&self, key: &str) -> u32 {
        match self.live_entry(key) {
            Some(entry) => self.max_requests.saturating_sub(entry.count),
            None => self.max_requests,
        }
    }

    /// Whole seconds (rounded up) until `key`'s window closes.
    ///
    /// Keys without a live window report the full window length.
    pub fn window_seconds_remaining(&self, key: &str) -> u64 {
        match self.live_entry(key) {
            Some(entry) => {
                let left = (entry.window_start + self.window).saturating_duration_since(Instant::now());
                left.as_secs_f64().ceil() as u64
            }
            None => self.window.as_secs(),
        }
    }

    /// Requests counted for `key` in its current window (0 if none is open).
    pub fn current_count(&self, key: &str) -> u32 {
        self.live_entry(key).map(|entry| entry.count).unwrap_or(0)
    }

    /// Forget `key`; its next request starts a fresh window.
    pub fn clear_limit(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Forget every key.
    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Drop entries whose window has already closed. Returns how many were removed.
    ///
    /// Admission results are unaffected: an expired entry would be replaced on
    /// the key's next request anyway.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, window));
        before - self.entries.len()
    }

    /// Number of keys currently held in memory.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_seconds(&self) -> u64 {
        self.window.as_secs()
    }

    fn live_entry(&self, key: &str) -> Option<&WindowEntry> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now(), self.window))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}
