//! # Warden Core - Resilience and Process Supervision
//!
//! Building blocks for keeping a network service up:
//! - Fixed-window rate limiting per caller key
//! - Circuit breaking with bounded exponential-backoff retry per context
//! - Primary/worker process supervision with crash restart, memory-ceiling
//!   rejuvenation and drain-then-force shutdown
//! - Health monitoring with periodically persisted snapshots
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   SIGTERM   →   │        Primary process       │
//!                 │  ┌──────────┐ ┌───────────┐  │
//!                 │  │Supervisor│→│  Health   │──┼──→ health-status.json
//!                 │  │  (loop)  │ │  Monitor  │  │
//!                 │  └────┬─────┘ └───────────┘  │
//!                 └───────┼──────────────────────┘
//!              spawn/kill │ ▲ stdout: heartbeat, draining
//!                         ▼ │ exit code: 0 / 75 / other
//!                 ┌──────────────────────────────┐
//!                 │ Worker process (× workers)   │
//!                 │  WorkerRuntime → service     │
//!                 │  RateLimiter  Resilience     │
//!                 └──────────────────────────────┘
//! ```
//!
//! Breaker and limiter state is per process; workers never share it.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod health;
pub mod maintenance;
pub mod rate_limiter;
pub mod recovery;
pub mod resilience;
pub mod status;
pub mod status_server;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
