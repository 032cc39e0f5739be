//! Health monitoring.
//!
//! The primary keeps one record per worker, fed by heartbeats, plus a host
//! sample. Snapshots of both are persisted on a timer for external
//! inspection and are readable synchronously through
//! [`HealthMonitor::get_health_status`]. Alerting on the data is left to
//! consumers of [`HealthMonitor::subscribe`].

pub mod monitor;
pub mod probe;
pub mod types;

pub use monitor::{read_snapshot, write_snapshot, HealthMonitor};
pub use probe::{ResourceProbe, StaticProbe, SysinfoProbe};
pub use types::{
    HealthEvent, HealthSnapshot, ProcessSample, SystemSample, WorkerHeartbeat, WorkerRecord,
    WorkerStatus,
};
