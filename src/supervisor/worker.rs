//! Worker process runtime.
//!
//! Runs one [`WorkerService`] and turns every fatal condition into the same
//! graceful shutdown: stop accepting, drain in-flight work up to
//! `drain_timeout`, then exit. Triggers:
//!
//! - SIGTERM / SIGINT
//! - the service panicking or returning an error
//! - the service returning on its own
//! - resident memory above `memory_ceiling_bytes` (proactive restart)
//!
//! Only the first trigger counts; later ones are ignored.

use async_trait::async_trait;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::launcher::SLOT_ENV;
use super::protocol::{encode_line, ShutdownReason, WorkerMessage, RESTART_EXIT_CODE};
use crate::health::{HealthMonitor, ResourceProbe, WorkerHeartbeat};
use crate::recovery::catch_panic;
use crate::types::{Error, Result, SupervisorConfig, WorkerId, WorkerSlot};

/// Exit code of a worker that drained after a termination signal.
pub const TERMINATED_EXIT_CODE: i32 = 143;

/// The service a worker runs. It must stop accepting new work once
/// `shutdown` is cancelled and return when in-flight work is done.
#[async_trait]
pub trait WorkerService: Send + Sync + 'static {
    async fn serve(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Adapter turning a closure into a [`WorkerService`].
#[derive(Debug, Clone)]
pub struct ServiceFn<F>(F);

pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    ServiceFn(f)
}

#[async_trait]
impl<F, Fut> WorkerService for ServiceFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        (self.0)(shutdown).await
    }
}

/// Sink for messages to the primary.
pub trait Reporter: Send + Sync + std::fmt::Debug {
    fn report(&self, message: &WorkerMessage);
}

/// Writes protocol lines to stdout, where the primary reads them.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    fn report(&self, message: &WorkerMessage) {
        let line = match encode_line(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "worker_message_encode_failed");
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
            tracing::warn!(error = %e, "worker_message_write_failed");
        }
    }
}

/// Delivers messages over a channel; used when the worker runs in-process.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, message: &WorkerMessage) {
        let _ = self.tx.send(message.clone());
    }
}

/// Single-shot shutdown latch.
#[derive(Debug, Clone, Default)]
pub struct ShutdownTrigger {
    inner: Arc<TriggerInner>,
}

#[derive(Debug, Default)]
struct TriggerInner {
    shutting_down: AtomicBool,
    reason: Mutex<Option<ShutdownReason>>,
    fired: CancellationToken,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start shutdown. Returns false if shutdown was already in progress.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self
            .inner
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(reason = %reason, "shutdown_already_in_progress");
            return false;
        }
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.inner.fired.cancel();
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Reason recorded by the first trigger.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        self.inner.fired.cancelled().await
    }
}

/// How the worker process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Service finished on its own.
    Clean,
    /// Proactive restart; the primary replaces the worker after a delay.
    Restart,
    /// Drained after a termination signal.
    Terminated,
    /// Service panicked or failed.
    Fault,
    /// Drain did not finish in time.
    Forced,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Clean => 0,
            WorkerExit::Restart => RESTART_EXIT_CODE,
            WorkerExit::Terminated => TERMINATED_EXIT_CODE,
            WorkerExit::Fault => 1,
            WorkerExit::Forced => 2,
        }
    }

    fn for_reason(reason: &ShutdownReason) -> Self {
        match reason {
            ShutdownReason::Signal => WorkerExit::Terminated,
            ShutdownReason::Panic { .. } | ShutdownReason::ServiceError { .. } => WorkerExit::Fault,
            ShutdownReason::MemoryCeiling { .. } => WorkerExit::Restart,
            ShutdownReason::ServiceExited => WorkerExit::Clean,
        }
    }
}

type Termination = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Worker-side supervision loop.
pub struct WorkerRuntime {
    config: SupervisorConfig,
    slot: WorkerSlot,
    pid: WorkerId,
    probe: Arc<dyn ResourceProbe>,
    reporter: Arc<dyn Reporter>,
    monitor: Option<HealthMonitor>,
    trigger: ShutdownTrigger,
    termination: Option<Termination>,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("slot", &self.slot)
            .field("pid", &self.pid)
            .field("shutting_down", &self.trigger.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    pub fn new(
        config: SupervisorConfig,
        slot: WorkerSlot,
        probe: Arc<dyn ResourceProbe>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            slot,
            pid: WorkerId::new(std::process::id()),
            probe,
            reporter,
            monitor: None,
            trigger: ShutdownTrigger::new(),
            termination: None,
        }
    }

    /// Also record heartbeats in a process-local health monitor.
    pub fn with_monitor(mut self, monitor: HealthMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Replace the default SIGTERM/SIGINT listener.
    pub fn with_termination<F>(mut self, termination: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.termination = Some(Box::pin(termination));
        self
    }

    /// Handle for triggering shutdown from outside the runtime.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Run `service` until a shutdown trigger, then drain.
    pub async fn run<S: WorkerService>(mut self, service: S) -> WorkerExit {
        let service = Arc::new(service);
        let stop_accepting = CancellationToken::new();
        let mut service_task = {
            let service = service.clone();
            let token = stop_accepting.clone();
            tokio::spawn(async move { catch_panic(service.serve(token)).await })
        };

        if let Some(monitor) = &self.monitor {
            monitor.register_worker(self.pid, self.slot);
        }
        tracing::info!(slot = %self.slot, pid = %self.pid, "worker_started");

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut memory_check = interval(self.config.memory_check_interval);
        memory_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut termination = self
            .termination
            .take()
            .unwrap_or_else(|| Box::pin(wait_for_termination()));
        let mut terminated = false;
        let mut service_finished = false;
        let trigger = self.trigger.clone();

        while !trigger.is_shutting_down() {
            tokio::select! {
                _ = heartbeat.tick() => self.heartbeat(),
                _ = memory_check.tick() => self.check_memory(),
                _ = &mut termination, if !terminated => {
                    terminated = true;
                    trigger.trigger(ShutdownReason::Signal);
                }
                joined = &mut service_task, if !service_finished => {
                    service_finished = true;
                    let reason = match joined {
                        Ok(Ok(Ok(()))) => ShutdownReason::ServiceExited,
                        Ok(Ok(Err(e))) => ShutdownReason::ServiceError { message: e.to_string() },
                        Ok(Err(message)) => ShutdownReason::Panic { message },
                        Err(e) => ShutdownReason::Panic { message: e.to_string() },
                    };
                    trigger.trigger(reason);
                }
                _ = trigger.triggered() => {}
            }
        }

        let reason = trigger.reason().unwrap_or(ShutdownReason::Signal);
        self.drain(reason, stop_accepting, service_task, service_finished)
            .await
    }

    async fn drain(
        self,
        reason: ShutdownReason,
        stop_accepting: CancellationToken,
        mut service_task: tokio::task::JoinHandle<std::result::Result<Result<()>, String>>,
        service_finished: bool,
    ) -> WorkerExit {
        match &reason {
            ShutdownReason::Panic { .. } | ShutdownReason::ServiceError { .. } => {
                tracing::error!(slot = %self.slot, reason = %reason, "worker_fault");
            }
            _ => tracing::info!(slot = %self.slot, reason = %reason, "worker_shutting_down"),
        }

        self.reporter.report(&WorkerMessage::Draining {
            slot: self.slot,
            pid: self.pid,
            reason: reason.clone(),
        });
        if let Some(monitor) = &self.monitor {
            monitor.mark_shutting_down(self.pid);
        }

        stop_accepting.cancel();

        let mut exit = WorkerExit::for_reason(&reason);
        if !service_finished {
            match tokio::time::timeout(self.config.drain_timeout, &mut service_task).await {
                Ok(Ok(Err(message))) => {
                    tracing::error!(slot = %self.slot, panic = %message, "worker_panicked_while_draining");
                }
                Ok(_) => {}
                Err(_) => {
                    service_task.abort();
                    tracing::warn!(
                        slot = %self.slot,
                        drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
                        "drain_timeout_elapsed"
                    );
                    exit = WorkerExit::Forced;
                }
            }
        }

        if let Some(monitor) = &self.monitor {
            monitor.mark_dead(self.pid).await;
        }
        tracing::info!(slot = %self.slot, code = exit.code(), "worker_exiting");
        exit
    }

    fn heartbeat(&self) {
        let sample = self.probe.current_process().unwrap_or_default();
        self.reporter.report(&WorkerMessage::Heartbeat {
            slot: self.slot,
            pid: self.pid,
            memory: sample.memory,
            cpu: sample.cpu,
        });
        if let Some(monitor) = &self.monitor {
            monitor.update_worker_health(
                self.pid,
                WorkerHeartbeat {
                    slot: self.slot,
                    memory: sample.memory,
                    cpu: sample.cpu,
                },
            );
        }
    }

    fn check_memory(&self) {
        let Some(sample) = self.probe.current_process() else {
            tracing::debug!(slot = %self.slot, "memory_sample_unavailable");
            return;
        };
        let ceiling = self.config.memory_ceiling_bytes;
        if sample.memory > ceiling && !self.trigger.is_shutting_down() {
            tracing::warn!(
                slot = %self.slot,
                memory = sample.memory,
                ceiling,
                "memory_ceiling_exceeded"
            );
            self.trigger.trigger(ShutdownReason::MemoryCeiling {
                bytes: sample.memory,
            });
        }
    }
}

/// Resolves on SIGTERM or SIGINT.
pub async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "sigint_listener_failed");
                            std::future::pending::<()>().await;
                        }
                    }
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "sigterm_listener_failed"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "sigint_listener_failed");
        std::future::pending::<()>().await;
    }
}

/// Slot assigned by the primary, from the launch environment.
pub fn slot_from_env() -> Result<WorkerSlot> {
    match std::env::var(SLOT_ENV) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(WorkerSlot::new)
            .map_err(|_| Error::config(format!("{} is not a slot index: {:?}", SLOT_ENV, raw))),
        Err(std::env::VarError::NotPresent) => Ok(WorkerSlot::new(0)),
        Err(e) => Err(Error::config(format!("{}: {}", SLOT_ENV, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_single_shot() {
        let trigger = ShutdownTrigger::new();
        assert!(!trigger.is_shutting_down());

        assert!(trigger.trigger(ShutdownReason::MemoryCeiling { bytes: 1 }));
        assert!(!trigger.trigger(ShutdownReason::Signal));

        assert!(trigger.is_shutting_down());
        assert_eq!(
            trigger.reason(),
            Some(ShutdownReason::MemoryCeiling { bytes: 1 })
        );
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let trigger = ShutdownTrigger::new();
        let waiter = {
            let trigger = trigger.clone();
            tokio::spawn(async move { trigger.triggered().await })
        };
        trigger.trigger(ShutdownReason::Signal);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerExit::Clean.code(), 0);
        assert_eq!(WorkerExit::Restart.code(), RESTART_EXIT_CODE);
        assert_eq!(WorkerExit::Terminated.code(), 143);
        assert_eq!(WorkerExit::Fault.code(), 1);
        assert_eq!(WorkerExit::Forced.code(), 2);
    }

    #[test]
    fn test_exit_for_reason() {
        assert_eq!(
            WorkerExit::for_reason(&ShutdownReason::MemoryCeiling { bytes: 9 }),
            WorkerExit::Restart
        );
        assert_eq!(
            WorkerExit::for_reason(&ShutdownReason::ServiceError {
                message: "x".into()
            }),
            WorkerExit::Fault
        );
        assert_eq!(
            WorkerExit::for_reason(&ShutdownReason::ServiceExited),
            WorkerExit::Clean
        );
    }

    #[test]
    fn test_channel_reporter_delivers() {
        let (reporter, mut rx) = ChannelReporter::new();
        reporter.report(&WorkerMessage::Draining {
            slot: WorkerSlot::new(0),
            pid: WorkerId::new(1),
            reason: ShutdownReason::Signal,
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkerMessage::Draining { .. }
        ));
    }
}
