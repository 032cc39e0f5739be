//! Primary process: keeps the configured number of workers running.
//!
//! A single task owns all supervision state and consumes
//! [`SupervisorEvent`]s from launchers, restart timers and itself:
//!
//! ```text
//!  launcher tasks ──Message/Exited──┐
//!  restart timers ──RestartDue──────┼──► mpsc ──► Supervisor::run ──► HealthMonitor
//!                                   │
//!  shutdown token ──────────────────┘ (select)
//! ```
//!
//! Crashed workers are replaced immediately and without limit. A worker that
//! exits with [`RESTART_EXIT_CODE`](super::protocol::RESTART_EXIT_CODE) is
//! replaced after `restart_delay`. A clean exit leaves its slot empty.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::launcher::{StopSignal, WorkerLauncher};
use super::protocol::{ExitKind, WorkerMessage};
use crate::health::{HealthMonitor, WorkerHeartbeat};
use crate::types::{Error, Result, SupervisorConfig, WorkerId, WorkerSlot};

const EVENT_CAPACITY: usize = 256;

/// Wait for SIGKILLed workers to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Input to the supervision loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// Protocol message read from a worker.
    Message { id: WorkerId, message: WorkerMessage },
    /// A worker process ended.
    Exited {
        id: WorkerId,
        slot: WorkerSlot,
        exit: ExitKind,
    },
    /// A delayed relaunch for `slot` is due.
    RestartDue { slot: WorkerSlot },
}

/// Counters returned when the supervisor stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorReport {
    pub launches: u64,
    pub restarts: u64,
    pub crashes: u64,
    pub launch_failures: u64,
}

/// Primary-side process supervisor.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    monitor: HealthMonitor,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: mpsc::Receiver<SupervisorEvent>,
    workers: HashMap<WorkerId, WorkerSlot>,
    pending_restarts: usize,
    shutdown: CancellationToken,
    report: SupervisorReport,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        monitor: HealthMonitor,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            config,
            launcher,
            monitor,
            events_tx,
            events_rx,
            workers: HashMap::new(),
            pending_restarts: 0,
            shutdown: CancellationToken::new(),
            report: SupervisorReport::default(),
        }
    }

    /// Token that stops the supervisor when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Launch all workers and supervise them until shutdown, or until every
    /// slot has exited cleanly.
    pub async fn run(mut self) -> Result<SupervisorReport> {
        if self.config.workers == 0 {
            return Err(Error::validation("supervisor needs at least one worker"));
        }

        tracing::info!(workers = self.config.workers, "supervisor_started");
        for index in 0..self.config.workers {
            self.launch(WorkerSlot::new(index), false).await;
        }

        loop {
            if self.workers.is_empty() && self.pending_restarts == 0 {
                tracing::info!("supervisor_all_workers_exited");
                break;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        self.shutdown.cancel();
        self.drain().await;
        tracing::info!(
            launches = self.report.launches,
            restarts = self.report.restarts,
            crashes = self.report.crashes,
            "supervisor_stopped"
        );
        Ok(self.report)
    }

    async fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Message { id, message } => self.handle_message(id, message),
            SupervisorEvent::Exited { id, slot, exit } => self.handle_exit(id, slot, exit).await,
            SupervisorEvent::RestartDue { slot } => {
                self.pending_restarts = self.pending_restarts.saturating_sub(1);
                if !self.shutdown.is_cancelled() {
                    self.launch(slot, true).await;
                }
            }
        }
    }

    fn handle_message(&mut self, id: WorkerId, message: WorkerMessage) {
        if !self.workers.contains_key(&id) {
            tracing::debug!(worker = %id, "message_from_unknown_worker");
            return;
        }
        match message {
            WorkerMessage::Heartbeat {
                slot, memory, cpu, ..
            } => {
                self.monitor
                    .update_worker_health(id, WorkerHeartbeat { slot, memory, cpu });
            }
            WorkerMessage::Draining { reason, .. } => {
                tracing::info!(worker = %id, reason = %reason, "worker_draining");
                self.monitor.mark_shutting_down(id);
            }
        }
    }

    async fn handle_exit(&mut self, id: WorkerId, slot: WorkerSlot, exit: ExitKind) {
        self.workers.remove(&id);
        self.monitor.mark_dead(id).await;

        if self.shutdown.is_cancelled() {
            tracing::info!(worker = %id, %slot, code = exit.code(), "worker_exited_during_shutdown");
            return;
        }

        match exit {
            ExitKind::Clean => {
                tracing::info!(worker = %id, %slot, "worker_exited_cleanly");
            }
            ExitKind::RestartRequested => {
                tracing::info!(
                    worker = %id,
                    %slot,
                    delay_ms = self.config.restart_delay.as_millis() as u64,
                    "worker_restart_requested"
                );
                self.schedule_restart(slot);
            }
            ExitKind::Crashed { code } => {
                self.report.crashes += 1;
                tracing::warn!(worker = %id, %slot, code, "worker_crashed");
                self.launch(slot, true).await;
            }
        }
    }

    async fn launch(&mut self, slot: WorkerSlot, replacement: bool) {
        match self.launcher.launch(slot, self.events_tx.clone()).await {
            Ok(id) => {
                self.workers.insert(id, slot);
                self.monitor.register_worker(id, slot);
                self.report.launches += 1;
                if replacement {
                    self.report.restarts += 1;
                }
                tracing::info!(worker = %id, %slot, "worker_started");
            }
            Err(e) => {
                self.report.launch_failures += 1;
                tracing::error!(%slot, error = %e, "worker_launch_failed");
                self.schedule_restart(slot);
            }
        }
    }

    fn schedule_restart(&mut self, slot: WorkerSlot) {
        self.pending_restarts += 1;
        let events = self.events_tx.clone();
        let delay = self.config.restart_delay;
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(SupervisorEvent::RestartDue { slot }).await;
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Terminate live workers, escalating to SIGKILL after the drain bound.
    async fn drain(&mut self) {
        if !self.workers.is_empty() {
            tracing::info!(workers = self.workers.len(), "supervisor_draining_workers");
            self.signal_all(StopSignal::Terminate);

            let deadline = Instant::now() + self.config.drain_timeout + self.config.kill_grace;
            self.await_exits(deadline).await;

            if !self.workers.is_empty() {
                tracing::warn!(workers = self.workers.len(), "supervisor_killing_workers");
                self.signal_all(StopSignal::Kill);
                self.await_exits(Instant::now() + KILL_WAIT).await;
            }
        }

        if let Err(e) = self.monitor.persist().await {
            tracing::warn!(error = %e, "final_health_snapshot_failed");
        }
    }

    fn signal_all(&self, signal: StopSignal) {
        for id in self.workers.keys() {
            if signal == StopSignal::Terminate {
                self.monitor.mark_shutting_down(*id);
            }
            if let Err(e) = self.launcher.signal(*id, signal) {
                tracing::warn!(worker = %id, error = %e, "worker_signal_failed");
            }
        }
    }

    async fn await_exits(&mut self, deadline: Instant) {
        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) | Err(_) => break,
            }
        }
    }
}
