//! Health monitor: worker records, system samples and snapshot persistence.
//!
//! Two independent timers run in the background task:
//! - system sampler: refreshes host memory and load average
//! - snapshot persister: overwrites the health artifact with the latest view
//!
//! The artifact is written by every process that runs a monitor, with no
//! locking. Concurrent writers race and the last rename wins.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::probe::ResourceProbe;
use super::types::{
    HealthEvent, HealthSnapshot, SystemSample, WorkerHeartbeat, WorkerRecord, WorkerStatus,
};
use crate::types::{HealthConfig, Result, WorkerId, WorkerSlot};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct MonitorState {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    system: SystemSample,
}

/// Process-local health state with periodic persistence.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn ResourceProbe>,
    state: Arc<Mutex<MonitorState>>,
    events: broadcast::Sender<HealthEvent>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            probe,
            state: Arc::new(Mutex::new(MonitorState::default())),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Receive worker status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn probe(&self) -> Arc<dyn ResourceProbe> {
        self.probe.clone()
    }

    pub fn health_file(&self) -> &Path {
        &self.config.health_file
    }

    /// Track a freshly launched worker as STARTING.
    pub fn register_worker(&self, id: WorkerId, slot: WorkerSlot) {
        let previous = {
            let mut state = self.lock();
            state
                .workers
                .insert(
                    id,
                    WorkerRecord {
                        id,
                        slot,
                        status: WorkerStatus::Starting,
                        last_check: Utc::now(),
                        memory: 0,
                        cpu: 0.0,
                    },
                )
                .map(|record| record.status)
        };
        self.emit(id, previous, WorkerStatus::Starting);
    }

    /// Apply a heartbeat. The first heartbeat moves a worker to ALIVE; a
    /// worker already draining stays SHUTTING_DOWN.
    pub fn update_worker_health(&self, id: WorkerId, heartbeat: WorkerHeartbeat) {
        let (from, to) = {
            let mut state = self.lock();
            let record = state.workers.entry(id).or_insert_with(|| WorkerRecord {
                id,
                slot: heartbeat.slot,
                status: WorkerStatus::Starting,
                last_check: Utc::now(),
                memory: 0,
                cpu: 0.0,
            });
            let from = record.status;
            if record.status == WorkerStatus::Starting {
                record.status = WorkerStatus::Alive;
            }
            record.last_check = Utc::now();
            record.memory = heartbeat.memory;
            record.cpu = heartbeat.cpu;
            (from, record.status)
        };
        if from != to {
            self.emit(id, Some(from), to);
        }
    }

    /// Mark a worker as draining.
    pub fn mark_shutting_down(&self, id: WorkerId) {
        let from = {
            let mut state = self.lock();
            match state.workers.get_mut(&id) {
                Some(record) if record.status != WorkerStatus::ShuttingDown => {
                    let from = record.status;
                    record.status = WorkerStatus::ShuttingDown;
                    Some(from)
                }
                _ => None,
            }
        };
        if let Some(from) = from {
            self.emit(id, Some(from), WorkerStatus::ShuttingDown);
        }
    }

    /// Mark a worker DEAD, persist a snapshot that still shows it, then drop
    /// it from the live set.
    pub async fn mark_dead(&self, id: WorkerId) {
        let (snapshot, from) = {
            let mut state = self.lock();
            let Some(record) = state.workers.get_mut(&id) else {
                return;
            };
            let from = record.status;
            record.status = WorkerStatus::Dead;
            record.last_check = Utc::now();
            let snapshot = Self::build_snapshot(&state);
            state.workers.remove(&id);
            (snapshot, from)
        };
        self.emit(id, Some(from), WorkerStatus::Dead);
        self.write_swallowing(&snapshot).await;
    }

    /// Refresh the host sample from the probe.
    pub fn sample_system(&self) -> SystemSample {
        let sample = self.probe.system();
        self.lock().system = sample;
        sample
    }

    /// Current in-memory view.
    pub fn get_health_status(&self) -> HealthSnapshot {
        Self::build_snapshot(&self.lock())
    }

    pub fn worker(&self, id: WorkerId) -> Option<WorkerRecord> {
        self.lock().workers.get(&id).cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Write the current snapshot to the health artifact.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.get_health_status();
        write_snapshot(&self.config.health_file, &snapshot).await
    }

    /// Start the sampler and persister timers.
    /// Returns immediately; both run in one spawned task until [`stop`](Self::stop).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut sampler = interval(monitor.config.system_sample_interval);
            let mut persister = interval(monitor.config.snapshot_interval);
            sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
            persister.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sampler.tick() => {
                        monitor.sample_system();
                    }
                    _ = persister.tick() => {
                        let snapshot = monitor.get_health_status();
                        monitor.write_swallowing(&snapshot).await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("health_monitor_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the background timers.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn build_snapshot(state: &MonitorState) -> HealthSnapshot {
        HealthSnapshot {
            timestamp: Utc::now(),
            workers: state.workers.values().cloned().collect(),
            system: state.system,
        }
    }

    async fn write_swallowing(&self, snapshot: &HealthSnapshot) {
        if let Err(e) = write_snapshot(&self.config.health_file, snapshot).await {
            tracing::warn!(
                path = %self.config.health_file.display(),
                error = %e,
                "health_snapshot_write_failed"
            );
        }
    }

    fn emit(&self, id: WorkerId, from: Option<WorkerStatus>, to: WorkerStatus) {
        tracing::debug!(worker = %id, from = ?from, to = ?to, "worker_status_changed");
        // No subscribers is fine.
        let _ = self
            .events
            .send(HealthEvent::WorkerStatusChanged { id, from, to });
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Overwrite `path` with `snapshot` via a per-process temp file and rename.
pub async fn write_snapshot(path: &Path, snapshot: &HealthSnapshot) -> Result<()> {
    let body = serde_json::to_vec_pretty(snapshot)?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read a previously persisted snapshot.
pub async fn read_snapshot(path: &Path) -> Result<HealthSnapshot> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "health".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::StaticProbe;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn monitor_in(dir: &Path) -> (HealthMonitor, Arc<StaticProbe>) {
        let probe = Arc::new(StaticProbe::new());
        probe.set_system(SystemSample {
            total_memory: 1000,
            free_memory: 400,
            load_average: [0.1, 0.2, 0.3],
        });
        let config = HealthConfig {
            system_sample_interval: Duration::from_millis(50),
            snapshot_interval: Duration::from_millis(50),
            health_file: dir.join("health.json"),
        };
        (HealthMonitor::new(config, probe.clone()), probe)
    }

    fn beat(slot: usize, memory: u64) -> WorkerHeartbeat {
        WorkerHeartbeat {
            slot: WorkerSlot::new(slot),
            memory,
            cpu: 2.0,
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _) = monitor_in(dir.path());
        let id = WorkerId::new(100);

        monitor.register_worker(id, WorkerSlot::new(0));
        assert_eq!(monitor.worker(id).unwrap().status, WorkerStatus::Starting);

        monitor.update_worker_health(id, beat(0, 2048));
        let record = monitor.worker(id).unwrap();
        assert_eq!(record.status, WorkerStatus::Alive);
        assert_eq!(record.memory, 2048);

        monitor.mark_shutting_down(id);
        monitor.update_worker_health(id, beat(0, 4096));
        let record = monitor.worker(id).unwrap();
        assert_eq!(record.status, WorkerStatus::ShuttingDown);
        assert_eq!(record.memory, 4096);
    }

    #[tokio::test]
    async fn test_mark_dead_persists_then_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _) = monitor_in(dir.path());
        let id = WorkerId::new(7);
        monitor.register_worker(id, WorkerSlot::new(1));
        monitor.update_worker_health(id, beat(1, 10));

        monitor.mark_dead(id).await;

        assert_eq!(monitor.worker_count(), 0);
        let persisted = read_snapshot(monitor.health_file()).await.unwrap();
        assert_eq!(persisted.workers.len(), 1);
        assert_eq!(persisted.workers[0].status, WorkerStatus::Dead);
        assert_eq!(persisted.workers[0].memory, 10);
    }

    #[tokio::test]
    async fn test_events_report_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _) = monitor_in(dir.path());
        let mut events = monitor.subscribe();
        let id = WorkerId::new(3);

        monitor.register_worker(id, WorkerSlot::new(0));
        monitor.update_worker_health(id, beat(0, 1));
        monitor.update_worker_health(id, beat(0, 2));

        assert_eq!(
            events.recv().await.unwrap(),
            HealthEvent::WorkerStatusChanged {
                id,
                from: None,
                to: WorkerStatus::Starting
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            HealthEvent::WorkerStatusChanged {
                id,
                from: Some(WorkerStatus::Starting),
                to: WorkerStatus::Alive
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_persist_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _) = monitor_in(dir.path());
        monitor.sample_system();
        monitor.register_worker(WorkerId::new(1), WorkerSlot::new(0));
        monitor.persist().await.unwrap();
        monitor.register_worker(WorkerId::new(2), WorkerSlot::new(1));
        monitor.persist().await.unwrap();

        let persisted = read_snapshot(monitor.health_file()).await.unwrap();
        assert_eq!(persisted.workers.len(), 2);
        assert_eq!(persisted.system.total_memory, 1000);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_persist_failure_is_swallowed() {
        let probe = Arc::new(StaticProbe::new());
        let config = HealthConfig {
            system_sample_interval: Duration::from_millis(10),
            snapshot_interval: Duration::from_millis(10),
            health_file: PathBuf::from("/nonexistent-dir/health.json"),
        };
        let monitor = HealthMonitor::new(config, probe);
        assert!(monitor.persist().await.is_err());

        let id = WorkerId::new(9);
        monitor.register_worker(id, WorkerSlot::new(0));
        monitor.mark_dead(id).await;

        assert_eq!(monitor.worker_count(), 0);
        assert!(logs_contain("health_snapshot_write_failed"));
    }

    #[tokio::test]
    async fn test_background_timers_sample_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, probe) = monitor_in(dir.path());
        let handle = monitor.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        probe.set_system(SystemSample {
            total_memory: 2000,
            free_memory: 1000,
            load_average: [1.0, 1.0, 1.0],
        });
        tokio::time::sleep(Duration::from_millis(120)).await;

        monitor.stop();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

        assert_eq!(monitor.get_health_status().system.total_memory, 2000);
        let persisted = read_snapshot(monitor.health_file()).await.unwrap();
        assert!(persisted.system.total_memory > 0);
    }
}
