//! Health types: worker records, system samples and snapshots.
//!
//! Serialized field names follow the health artifact layout:
//! ```text
//! {timestamp, workers: [{id, slot, status, lastCheck, memory, cpu}],
//!  system: {totalMemory, freeMemory, cpuUsage}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{WorkerId, WorkerSlot};

/// Worker lifecycle as seen by the primary.
///
/// ```text
/// STARTING -> ALIVE -> SHUTTING_DOWN -> DEAD
///     |                                  ^
///     +----------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Alive,
    ShuttingDown,
    Dead,
}

impl WorkerStatus {
    pub fn is_live(self) -> bool {
        !matches!(self, WorkerStatus::Dead)
    }
}

/// Last known state of one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub slot: WorkerSlot,
    pub status: WorkerStatus,
    /// Time of the last heartbeat (or registration before the first one).
    pub last_check: DateTime<Utc>,
    /// Resident memory in bytes.
    pub memory: u64,
    /// CPU usage percentage as sampled by the worker.
    pub cpu: f32,
}

/// Heartbeat payload reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub slot: WorkerSlot,
    pub memory: u64,
    pub cpu: f32,
}

/// Host-wide resource sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSample {
    pub total_memory: u64,
    pub free_memory: u64,
    /// 1, 5 and 15 minute load averages.
    #[serde(rename = "cpuUsage", alias = "loadAverage")]
    pub load_average: [f64; 3],
}

/// Per-process resource sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub memory: u64,
    pub cpu: f32,
}

/// Immutable point-in-time view of workers and host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub workers: Vec<WorkerRecord>,
    pub system: SystemSample,
}

impl HealthSnapshot {
    pub fn alive_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Alive)
            .count()
    }
}

/// State change notifications for external alerting consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    WorkerStatusChanged {
        id: WorkerId,
        from: Option<WorkerStatus>,
        to: WorkerStatus,
    },
}
