//! Configuration structures.
//!
//! Configuration is loaded from `WARDEN_*` environment variables and optional
//! JSON config files. Every section falls back to its defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::errors::{Error, Result};

/// Prefix shared by every recognized environment key.
pub const ENV_PREFIX: &str = "WARDEN_";

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Retry and circuit-breaker policy.
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Fixed-window admission control.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Primary/worker process model.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Health sampling and snapshot persistence.
    #[serde(default)]
    pub health: HealthConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Retry/backoff and circuit-breaker options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retries allowed per context before a failure becomes terminal.
    pub retry_attempts: u32,

    /// Base backoff delay; attempt `n` waits `retry_delay * 2^n`.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Breaker thresholds.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// JSON-lines file receiving correction records (in-memory log when unset).
    #[serde(default)]
    pub correction_log: Option<PathBuf>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            circuit_breaker: CircuitBreakerConfig::default(),
            correction_log: None,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Recorded failures that trip the breaker open.
    pub failure_threshold: u32,

    /// Cooldown before an open breaker admits a trial request.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
        }
    }
}

/// Merge-style runtime update for [`ResilienceConfig`].
///
/// Absent fields keep their current value; the nested breaker section is
/// merged field by field rather than replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceUpdate {
    #[serde(default)]
    pub retry_attempts: Option<u32>,

    #[serde(default, with = "humantime_serde")]
    pub retry_delay: Option<Duration>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerUpdate>,
}

/// Partial breaker section of a [`ResilienceUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerUpdate {
    #[serde(default)]
    pub failure_threshold: Option<u32>,

    #[serde(default, with = "humantime_serde")]
    pub reset_timeout: Option<Duration>,
}

impl ResilienceConfig {
    /// Deep-merge an update into this config.
    pub fn merge(&mut self, update: &ResilienceUpdate) {
        if let Some(attempts) = update.retry_attempts {
            self.retry_attempts = attempts;
        }
        if let Some(delay) = update.retry_delay {
            self.retry_delay = delay;
        }
        if let Some(cb) = &update.circuit_breaker {
            if let Some(threshold) = cb.failure_threshold {
                self.circuit_breaker.failure_threshold = threshold;
            }
            if let Some(timeout) = cb.reset_timeout {
                self.circuit_breaker.reset_timeout = timeout;
            }
        }
    }
}

/// Fixed-window rate limiting options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per key per window.
    pub max_requests: u32,

    /// Window length in seconds.
    pub window_seconds: u64,

    /// How often the maintenance sweep drops expired windows.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_seconds: 60,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Process supervision options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Worker processes kept alive by the primary.
    pub workers: usize,

    /// Resident memory ceiling per worker before a proactive restart.
    pub memory_ceiling_bytes: u64,

    /// How often a worker samples its own memory.
    #[serde(with = "humantime_serde")]
    pub memory_check_interval: Duration,

    /// How often a worker reports a heartbeat to the primary.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Bound on waiting for in-flight work during graceful shutdown.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Pause before replacing a worker that restarted itself.
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Extra time the primary waits past the drain timeout before SIGKILL.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// Address workers serve on (shared through SO_REUSEPORT).
    pub listen_addr: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            memory_ceiling_bytes: 450 * 1024 * 1024,
            memory_check_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(2),
            kill_grace: Duration::from_secs(5),
            listen_addr: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Health monitor options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// System resource sampling period.
    #[serde(with = "humantime_serde")]
    pub system_sample_interval: Duration,

    /// Snapshot persistence period.
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,

    /// Health artifact path (overwritten on every persist).
    pub health_file: PathBuf,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            system_sample_interval: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(10),
            health_file: PathBuf::from("health-status.json"),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Load a JSON config file, then apply the process environment on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)?;
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Apply `WARDEN_*` overrides resolved through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        if let Some(v) = env.parse::<u32>("RETRY_ATTEMPTS")? {
            self.resilience.retry_attempts = v;
        }
        if let Some(v) = env.parse::<u64>("RETRY_DELAY_MS")? {
            self.resilience.retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env.parse::<u32>("FAILURE_THRESHOLD")? {
            self.resilience.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = env.parse::<u64>("RESET_TIMEOUT_MS")? {
            self.resilience.circuit_breaker.reset_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env.raw("CORRECTION_LOG") {
            self.resilience.correction_log = Some(PathBuf::from(v));
        }
        if let Some(v) = env.parse::<u32>("RATE_LIMIT_MAX")? {
            self.rate_limit.max_requests = v;
        }
        if let Some(v) = env.parse::<u64>("RATE_LIMIT_WINDOW_SECS")? {
            self.rate_limit.window_seconds = v;
        }
        if let Some(v) = env.parse::<u64>("MEMORY_CEILING_MB")? {
            self.supervisor.memory_ceiling_bytes = v.checked_mul(1024 * 1024).ok_or_else(|| {
                Error::config(format!("{}MEMORY_CEILING_MB: {} MiB is out of range", ENV_PREFIX, v))
            })?;
        }
        if let Some(v) = env.parse::<usize>("WORKERS")? {
            self.supervisor.workers = v;
        }
        if let Some(v) = env.parse::<u64>("HEARTBEAT_INTERVAL_MS")? {
            self.supervisor.heartbeat_interval = Duration::from_millis(v);
        }
        if let Some(v) = env.parse::<u64>("MEMORY_CHECK_INTERVAL_MS")? {
            self.supervisor.memory_check_interval = Duration::from_millis(v);
        }
        if let Some(v) = env.parse::<u64>("DRAIN_TIMEOUT_MS")? {
            self.supervisor.drain_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env.parse::<u64>("RESTART_DELAY_MS")? {
            self.supervisor.restart_delay = Duration::from_millis(v);
        }
        if let Some(v) = env.raw("LISTEN_ADDR") {
            self.supervisor.listen_addr = v;
        }
        if let Some(v) = env.parse::<u64>("SNAPSHOT_INTERVAL_MS")? {
            self.health.snapshot_interval = Duration::from_millis(v);
        }
        if let Some(v) = env.parse::<u64>("SYSTEM_SAMPLE_INTERVAL_MS")? {
            self.health.system_sample_interval = Duration::from_millis(v);
        }
        if let Some(v) = env.raw("HEALTH_FILE") {
            self.health.health_file = PathBuf::from(v);
        }
        if let Some(v) = env.raw("LOG_FORMAT") {
            self.observability.json_logs = v.eq_ignore_ascii_case("json");
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values that would stall timers or disable admission entirely.
    pub fn validate(&self) -> Result<()> {
        if self.supervisor.workers == 0 {
            return Err(Error::validation("supervisor.workers must be at least 1"));
        }
        if self.resilience.circuit_breaker.failure_threshold == 0 {
            return Err(Error::validation(
                "resilience.circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(Error::validation("rate_limit.max_requests must be at least 1"));
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(Error::validation("rate_limit.window_seconds must be at least 1"));
        }
        let intervals = [
            ("supervisor.heartbeat_interval", self.supervisor.heartbeat_interval),
            ("supervisor.memory_check_interval", self.supervisor.memory_check_interval),
            ("health.system_sample_interval", self.health.system_sample_interval),
            ("health.snapshot_interval", self.health.snapshot_interval),
            ("rate_limit.sweep_interval", self.rate_limit.sweep_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::validation(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, key)).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| {
                Error::config(format!("{}{}: cannot parse {:?}", ENV_PREFIX, key, value))
            }),
        }
    }
}
