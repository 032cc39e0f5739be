//! Resilient operation runner.
//!
//! `ResilienceHandle` combines per-context circuit breakers with a bounded
//! exponential-backoff retry budget. It is constructed explicitly and passed
//! down (cheap to clone); there is no process-wide instance.
//!
//! Outcomes are plain values rather than callbacks:
//! ```text
//! attempt(ctx, op) -> Success(T) | RetryAfter(delay) | CircuitOpen | Failed(reason)
//! ```
//! Breaker state is per process. Two workers guarding the same logical
//! context trip independently.

pub mod circuit_breaker;
pub mod correction;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use correction::{
    CorrectionEntry, CorrectionLog, CorrectionStatus, JsonlCorrectionLog, MemoryCorrectionLog,
    DEFAULT_RETAINED_CORRECTIONS,
};
pub use retry::RetryPolicy;

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::types::{Error, ResilienceConfig, ResilienceUpdate, Result};

/// Result of one breaker-guarded invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The operation succeeded.
    Success(T),
    /// The operation failed but budget remains; try again after the delay.
    RetryAfter(Duration),
    /// The breaker refused the call; the operation was not run.
    CircuitOpen,
    /// The failure is terminal; it was recorded and logged.
    Failed(String),
}

/// What the runner decided after a reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    RetryAfter(Duration),
    Failed { attempts: u32, reason: String },
}

/// Per-context view for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSummary {
    pub context: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub retry_attempts: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct ContextState {
    breaker: CircuitBreaker,
    attempts: u32,
    last_error: Option<String>,
}

#[derive(Debug)]
struct Registry {
    config: ResilienceConfig,
    contexts: HashMap<String, ContextState>,
}

impl Registry {
    /// Context entries are created lazily and live as long as the process.
    fn context(&mut self, context: &str) -> &mut ContextState {
        let breaker_config = &self.config.circuit_breaker;
        self.contexts
            .entry(context.to_string())
            .or_insert_with(|| ContextState {
                breaker: CircuitBreaker::new(breaker_config),
                attempts: 0,
                last_error: None,
            })
    }
}

/// Releases an admitted half-open trial when the call is dropped before its
/// outcome is recorded. If the registry is busy the breaker's trial lease
/// expires on its own.
struct TrialGuard<'a> {
    registry: &'a Mutex<Registry>,
    context: &'a str,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.registry.try_lock() {
            Ok(mut registry) => {
                if let Some(state) = registry.contexts.get_mut(self.context) {
                    state.breaker.release_trial();
                }
            }
            Err(_) => tracing::debug!(context = self.context, "circuit_trial_release_deferred"),
        }
    }
}

/// Handle to a context registry of breakers and retry counters.
#[derive(Debug, Clone)]
pub struct ResilienceHandle {
    registry: Arc<Mutex<Registry>>,
    log: Arc<dyn CorrectionLog>,
}

impl ResilienceHandle {
    pub fn new(config: ResilienceConfig, log: Arc<dyn CorrectionLog>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                config,
                contexts: HashMap::new(),
            })),
            log,
        }
    }

    /// Build with the correction log named in `config`.
    ///
    /// Without a path, only the last [`DEFAULT_RETAINED_CORRECTIONS`] records
    /// are kept in memory.
    pub fn from_config(config: ResilienceConfig) -> Self {
        let log: Arc<dyn CorrectionLog> = match &config.correction_log {
            Some(path) => Arc::new(JsonlCorrectionLog::new(path.clone())),
            None => Arc::new(MemoryCorrectionLog::new()),
        };
        Self::new(config, log)
    }

    /// Current configuration.
    pub async fn config(&self) -> ResilienceConfig {
        self.registry.lock().await.config.clone()
    }

    /// Merge an update into the config and apply it to existing breakers.
    pub async fn update_config(&self, update: &ResilienceUpdate) {
        let mut registry = self.registry.lock().await;
        registry.config.merge(update);
        let breaker_config = registry.config.circuit_breaker.clone();
        for state in registry.contexts.values_mut() {
            state.breaker.reconfigure(&breaker_config);
        }
        tracing::info!(
            retry_attempts = registry.config.retry_attempts,
            retry_delay_ms = registry.config.retry_delay.as_millis() as u64,
            failure_threshold = breaker_config.failure_threshold,
            reset_timeout_ms = breaker_config.reset_timeout.as_millis() as u64,
            "resilience_config_updated"
        );
    }

    /// Whether the breaker for `context` admits a call now.
    pub async fn can_request(&self, context: &str) -> bool {
        self.registry.lock().await.context(context).breaker.can_request()
    }

    /// Admit a call; `Some(true)` when it is the half-open trial.
    async fn admit(&self, context: &str) -> Option<bool> {
        let mut registry = self.registry.lock().await;
        let breaker = &mut registry.context(context).breaker;
        breaker
            .can_request()
            .then(|| breaker.state() == CircuitState::HalfOpen)
    }

    /// Breaker admission as a `Result`.
    pub async fn check(&self, context: &str) -> Result<()> {
        if self.can_request(context).await {
            Ok(())
        } else {
            Err(Error::circuit_open(context))
        }
    }

    /// Report a success for `context`.
    ///
    /// Closes the breaker. If the context had been retrying, clears the
    /// counter and writes a recovery record.
    pub async fn handle_success(&self, context: &str) {
        let recovered = {
            let mut registry = self.registry.lock().await;
            let state = registry.context(context);
            state.breaker.record_success();
            let attempts = std::mem::take(&mut state.attempts);
            let last_error = state.last_error.take();
            (attempts > 0).then(|| {
                CorrectionEntry::recovered(context, last_error.unwrap_or_default(), attempts + 1)
            })
        };

        if let Some(entry) = recovered {
            tracing::info!(context = context, attempts = entry.attempts, "operation_recovered");
            self.persist(entry).await;
        }
    }

    /// Report a failure for `context` and decide whether to retry.
    ///
    /// A failed half-open trial is terminal: the breaker re-opens at once.
    pub async fn handle_failure(&self, context: &str, reason: &str) -> Recovery {
        let (recovery, entry) = {
            let mut registry = self.registry.lock().await;
            let policy = RetryPolicy::from_config(&registry.config);
            let state = registry.context(context);
            state.last_error = Some(reason.to_string());

            let trial = state.breaker.state() == CircuitState::HalfOpen;
            if !trial && policy.should_retry(state.attempts) {
                let delay = policy.delay_for(state.attempts);
                state.attempts += 1;
                tracing::debug!(
                    context = context,
                    attempt = state.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = reason,
                    "operation_retry_scheduled"
                );
                (Recovery::RetryAfter(delay), None)
            } else {
                let attempts = std::mem::take(&mut state.attempts) + 1;
                state.last_error = None;
                state.breaker.record_failure();
                tracing::error!(
                    context = context,
                    attempts = attempts,
                    error = reason,
                    "operation_failed"
                );
                (
                    Recovery::Failed {
                        attempts,
                        reason: reason.to_string(),
                    },
                    Some(CorrectionEntry::failed(context, reason, attempts)),
                )
            }
        };

        if let Some(entry) = entry {
            self.persist(entry).await;
        }
        recovery
    }

    /// Run `op` once under the breaker for `context`.
    ///
    /// Dropping the returned future mid-call (deadline, drain, panic) gives
    /// back a half-open trial slot instead of holding it.
    pub async fn attempt<F, Fut, T, E>(&self, context: &str, op: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let Some(trial) = self.admit(context).await else {
            tracing::debug!(context = context, "circuit_rejected_call");
            return Outcome::CircuitOpen;
        };

        let mut guard = TrialGuard {
            registry: &self.registry,
            context,
            armed: trial,
        };
        let result = op().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.handle_success(context).await;
                Outcome::Success(value)
            }
            Err(e) => match self.handle_failure(context, &e.to_string()).await {
                Recovery::RetryAfter(delay) => Outcome::RetryAfter(delay),
                Recovery::Failed { reason, .. } => Outcome::Failed(reason),
            },
        }
    }

    /// Run `op` with breaker protection, sleeping through retry delays.
    ///
    /// Errors surface only as [`Error::CircuitOpen`] or
    /// [`Error::RetriesExhausted`].
    pub async fn execute<F, Fut, T, E>(&self, context: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut invocations: u32 = 0;
        loop {
            invocations += 1;
            match self.attempt(context, &mut op).await {
                Outcome::Success(value) => return Ok(value),
                Outcome::RetryAfter(delay) => tokio::time::sleep(delay).await,
                Outcome::CircuitOpen => return Err(Error::circuit_open(context)),
                Outcome::Failed(reason) => {
                    return Err(Error::RetriesExhausted {
                        context: context.to_string(),
                        attempts: invocations,
                        reason,
                    })
                }
            }
        }
    }

    /// Administratively close the breaker and clear retry state.
    pub async fn reset(&self, context: &str) {
        let mut registry = self.registry.lock().await;
        if let Some(state) = registry.contexts.get_mut(context) {
            state.breaker.record_success();
            state.attempts = 0;
            state.last_error = None;
        }
    }

    /// Breaker state for `context`, if it has been used.
    pub async fn breaker_state(&self, context: &str) -> Option<CircuitState> {
        let registry = self.registry.lock().await;
        registry.contexts.get(context).map(|s| s.breaker.state())
    }

    /// Every known context, sorted by name.
    pub async fn circuit_summary(&self) -> Vec<CircuitSummary> {
        let registry = self.registry.lock().await;
        let mut summary: Vec<CircuitSummary> = registry
            .contexts
            .iter()
            .map(|(context, state)| CircuitSummary {
                context: context.clone(),
                state: state.breaker.state(),
                failure_count: state.breaker.failure_count(),
                retry_attempts: state.attempts,
                cooldown_remaining_ms: state
                    .breaker
                    .cooldown_remaining()
                    .map(|d| d.as_millis() as u64),
            })
            .collect();
        summary.sort_by(|a, b| a.context.cmp(&b.context));
        summary
    }

    async fn persist(&self, entry: CorrectionEntry) {
        if let Err(e) = self.log.append(&entry).await {
            tracing::warn!(
                context = %entry.context,
                status = ?entry.status,
                error = %e,
                "correction_log_write_failed"
            );
        }
    }
}
