//! Supervisor integration tests with real child processes (`sh -c`).

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use warden_core::health::{HealthEvent, HealthMonitor, StaticProbe, WorkerStatus};
use warden_core::supervisor::{CommandLauncher, Supervisor, SupervisorReport};
use warden_core::types::{HealthConfig, SupervisorConfig};

fn sh(script: String) -> Arc<CommandLauncher> {
    Arc::new(CommandLauncher::new("sh", vec!["-c".to_string(), script]))
}

fn supervisor_config(workers: usize) -> SupervisorConfig {
    SupervisorConfig {
        workers,
        restart_delay: Duration::from_millis(300),
        drain_timeout: Duration::from_millis(300),
        kill_grace: Duration::from_millis(100),
        ..SupervisorConfig::default()
    }
}

fn monitor(dir: &Path) -> HealthMonitor {
    HealthMonitor::new(
        HealthConfig {
            health_file: dir.join("health.json"),
            ..HealthConfig::default()
        },
        Arc::new(StaticProbe::new()),
    )
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn stop(
    shutdown: tokio_util::sync::CancellationToken,
    task: tokio::task::JoinHandle<warden_core::Result<SupervisorReport>>,
) -> SupervisorReport {
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("supervisor stops")
        .unwrap()
        .unwrap()
}

/// Status transitions up to and including the second launch.
async fn collect_until_second_start(
    events: &mut tokio::sync::broadcast::Receiver<HealthEvent>,
) -> Vec<WorkerStatus> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("health event")
            .unwrap();
        let HealthEvent::WorkerStatusChanged { to, .. } = event;
        seen.push(to);
        if seen.iter().filter(|s| **s == WorkerStatus::Starting).count() == 2 {
            return seen;
        }
    }
}

/// First run does `first`; every later run sleeps until signalled.
fn once_then_sleep(dir: &Path, first: &str) -> String {
    let marker = dir.join("ran-once");
    format!(
        "if [ -f '{m}' ]; then exec sleep 30; else touch '{m}'; {first}; fi",
        m = marker.display(),
        first = first
    )
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let health = monitor(dir.path());
    let mut events = health.subscribe();
    let supervisor = Supervisor::new(
        supervisor_config(1),
        sh(once_then_sleep(dir.path(), "exit 1")),
        health.clone(),
    );
    let shutdown = supervisor.shutdown_handle();
    let task = tokio::spawn(supervisor.run());

    let transitions = collect_until_second_start(&mut events).await;
    assert_eq!(
        transitions,
        vec![WorkerStatus::Starting, WorkerStatus::Dead, WorkerStatus::Starting]
    );
    assert_eq!(health.worker_count(), 1);

    let report = stop(shutdown, task).await;
    assert_eq!(report.crashes, 1);
    assert_eq!(report.launches, 2);
    assert_eq!(health.worker_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_marks_worker_alive() {
    let dir = tempfile::tempdir().unwrap();
    let health = monitor(dir.path());
    let script = r#"echo '@warden:{"type":"heartbeat","slot":0,"pid":1,"memory":2048,"cpu":0.5}'; exec sleep 30"#;
    let supervisor = Supervisor::new(supervisor_config(1), sh(script.to_string()), health.clone());
    let shutdown = supervisor.shutdown_handle();
    let task = tokio::spawn(supervisor.run());

    wait_until("alive worker", || health.get_health_status().alive_workers() == 1).await;
    let record = health.get_health_status().workers[0].clone();
    assert_eq!(record.memory, 2048);
    assert_eq!(record.status, WorkerStatus::Alive);

    stop(shutdown, task).await;
}

#[tokio::test]
async fn test_restart_request_waits_for_delay() {
    let dir = tempfile::tempdir().unwrap();
    let health = monitor(dir.path());
    let mut events = health.subscribe();
    let config = supervisor_config(1);
    let delay = config.restart_delay;
    let supervisor = Supervisor::new(
        config,
        sh(once_then_sleep(dir.path(), "exit 75")),
        health.clone(),
    );
    let shutdown = supervisor.shutdown_handle();
    let task = tokio::spawn(supervisor.run());

    let mut starts = Vec::new();
    let mut dead_at = None;
    while starts.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("health event")
            .unwrap();
        let HealthEvent::WorkerStatusChanged { to, .. } = event;
        match to {
            WorkerStatus::Starting => starts.push(Instant::now()),
            WorkerStatus::Dead => dead_at = Some(Instant::now()),
            _ => {}
        }
    }

    let dead_at = dead_at.expect("first worker died before replacement");
    assert!(starts[1].duration_since(dead_at) >= delay - Duration::from_millis(20));

    let report = stop(shutdown, task).await;
    assert_eq!(report.crashes, 0);
    assert_eq!(report.restarts, 1);
}

#[tokio::test]
async fn test_clean_exit_is_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let health = monitor(dir.path());
    let supervisor = Supervisor::new(supervisor_config(2), sh("exit 0".to_string()), health.clone());

    let report = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
        .await
        .expect("supervisor stops when every slot exited cleanly")
        .unwrap();

    assert_eq!(report.launches, 2);
    assert_eq!(report.restarts, 0);
    assert_eq!(health.worker_count(), 0);
}

#[tokio::test]
async fn test_shutdown_kills_workers_ignoring_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let health = monitor(dir.path());
    let supervisor = Supervisor::new(
        supervisor_config(2),
        sh("trap '' TERM; exec sleep 30".to_string()),
        health.clone(),
    );
    let shutdown = supervisor.shutdown_handle();
    let task = tokio::spawn(supervisor.run());

    wait_until("two workers", || health.worker_count() == 2).await;
    // Give the shells time to install the trap before exec.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let report = stop(shutdown, task).await;

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(report.restarts, 0);
    assert_eq!(health.worker_count(), 0);

    let persisted = warden_core::health::read_snapshot(health.health_file())
        .await
        .unwrap();
    assert!(persisted.workers.is_empty());
}
