//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the warden resilience layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input or configuration value.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Admission denied by the rate limiter.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The circuit breaker for a context refused the call.
    #[error("circuit open for context {context}")]
    CircuitOpen { context: String },

    /// Retries for a context were exhausted; the last failure is carried along.
    #[error("retries exhausted for context {context} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        context: String,
        attempts: u32,
        reason: String,
    },

    /// A wrapped operation failed.
    #[error("operation failed: {0}")]
    Operation(String),

    /// Worker process could not be launched.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code, used in status server replies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Error::Operation(_) => "OPERATION_FAILED",
            Error::Spawn(_) => "SPAWN_FAILED",
            Error::Config(_) => "CONFIG",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }

    /// Whether the caller may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::CircuitOpen { .. } | Error::Timeout(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn circuit_open(context: impl Into<String>) -> Self {
        Self::CircuitOpen {
            context: context.into(),
        }
    }

    pub fn operation(msg: impl Into<String>) -> Self {
        Self::Operation(msg.into())
    }

    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
