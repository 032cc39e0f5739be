//! Aggregate service status for monitoring endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::{HealthMonitor, WorkerStatus};
use crate::resilience::{CircuitState, CircuitSummary, ResilienceHandle};

/// Coarse health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Combined worker and circuit view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub timestamp: DateTime<Utc>,
    pub overall: OverallHealth,
    pub workers_alive: usize,
    pub workers_total: usize,
    pub open_circuits: usize,
    pub circuits: Vec<CircuitSummary>,
}

/// Build the aggregate status from the health monitor and breaker registry.
///
/// No live worker means unhealthy. Any circuit not CLOSED, or any worker not
/// ALIVE, means degraded.
pub async fn get_service_status(
    monitor: &HealthMonitor,
    resilience: &ResilienceHandle,
) -> ServiceStatus {
    let snapshot = monitor.get_health_status();
    let circuits = resilience.circuit_summary().await;

    let workers_total = snapshot.workers.len();
    let workers_alive = snapshot.alive_workers();
    let open_circuits = circuits
        .iter()
        .filter(|c| c.state != CircuitState::Closed)
        .count();

    let overall = if workers_alive == 0 {
        OverallHealth::Unhealthy
    } else if open_circuits > 0
        || snapshot
            .workers
            .iter()
            .any(|w| w.status != WorkerStatus::Alive)
    {
        OverallHealth::Degraded
    } else {
        OverallHealth::Healthy
    };

    ServiceStatus {
        timestamp: Utc::now(),
        overall,
        workers_alive,
        workers_total,
        open_circuits,
        circuits,
    }
}
