//! Core types for the warden resilience layer.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed worker identifiers (process id, supervisor slot)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for resilience, admission, supervision and health

mod config;
mod errors;
mod ids;

pub use config::{
    CircuitBreakerConfig, CircuitBreakerUpdate, Config, HealthConfig, ObservabilityConfig,
    RateLimitConfig, ResilienceConfig, ResilienceUpdate, SupervisorConfig, ENV_PREFIX,
};
pub use errors::{Error, Result};
pub use ids::{WorkerId, WorkerSlot};
