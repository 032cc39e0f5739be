//! Worker process launching and signalling.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::primary::SupervisorEvent;
use super::protocol::{decode_line, ExitKind};
use crate::types::{Error, Result, WorkerId, WorkerSlot};

/// Environment variable carrying the worker's slot index.
pub const SLOT_ENV: &str = "WARDEN_WORKER_SLOT";

/// How long the stdout reader may lag behind process exit.
const READER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Signal sent to a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask for graceful shutdown (SIGTERM).
    Terminate,
    /// Kill outright (SIGKILL).
    Kill,
}

/// Starts worker processes and delivers their messages and exits as
/// [`SupervisorEvent`]s.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + std::fmt::Debug {
    /// Start a worker for `slot`. Exactly one `Exited` event must follow for
    /// the returned id.
    async fn launch(
        &self,
        slot: WorkerSlot,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<WorkerId>;

    /// Deliver a signal. Signalling a process that is already gone succeeds.
    fn signal(&self, id: WorkerId, signal: StopSignal) -> Result<()>;
}

/// Launches workers as child processes of the current process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run the current executable with the `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, vec!["worker".to_string()]))
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(
        &self,
        slot: WorkerSlot,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<WorkerId> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(SLOT_ENV, slot.get().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::spawn(format!("{}: {}", self.program.display(), e)))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::spawn("worker exited before reporting a pid"))?;
        let id = WorkerId::new(pid);

        let reader = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(forward_messages(stdout, id, events.clone())));

        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => classify(status),
                Err(e) => {
                    tracing::warn!(worker = %id, error = %e, "worker_wait_failed");
                    ExitKind::Crashed { code: -1 }
                }
            };

            // Let buffered messages (e.g. a final draining notice) land first.
            if let Some(mut reader) = reader {
                if tokio::time::timeout(READER_FLUSH_TIMEOUT, &mut reader)
                    .await
                    .is_err()
                {
                    reader.abort();
                }
            }

            let _ = events.send(SupervisorEvent::Exited { id, slot, exit }).await;
        });

        Ok(id)
    }

    #[cfg(unix)]
    fn signal(&self, id: WorkerId, signal: StopSignal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        let raw = i32::try_from(id.get())
            .map_err(|_| Error::validation(format!("pid out of range: {}", id)))?;

        match kill(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                tracing::debug!(worker = %id, "worker_already_gone");
                Ok(())
            }
            Err(e) => Err(Error::internal(format!(
                "failed to send {:?} to {}: {}",
                sig, id, e
            ))),
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, id: WorkerId, _signal: StopSignal) -> Result<()> {
        Err(Error::internal(format!(
            "signalling {} is not supported on this platform",
            id
        )))
    }
}

/// Forward protocol lines from a worker's stdout; echo everything else.
async fn forward_messages<R>(stdout: R, id: WorkerId, events: mpsc::Sender<SupervisorEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line(&line) {
                Some(Ok(message)) => {
                    if events
                        .send(SupervisorEvent::Message { id, message })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(worker = %id, error = %e, "worker_message_malformed");
                }
                None => tracing::info!(worker = %id, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "worker_stdout_read_failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn classify(status: ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;
    ExitKind::from_status(status.code(), status.signal())
}

#[cfg(not(unix))]
fn classify(status: ExitStatus) -> ExitKind {
    ExitKind::from_status(status.code(), None)
}


#[cfg(test)]
mod forward_tests {
    use super::*;
    use crate::supervisor::protocol::{encode_line, WorkerMessage, LINE_PREFIX};
    use tokio_test::io::Builder;

    fn heartbeat(memory: u64) -> String {
        let line = encode_line(&WorkerMessage::Heartbeat {
            slot: WorkerSlot::new(2),
            pid: WorkerId::new(900),
            memory,
            cpu: 0.5,
        })
        .unwrap();
        format!("{}\n", line)
    }

    fn memories(rx: &mut mpsc::Receiver<SupervisorEvent>) -> Vec<u64> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SupervisorEvent::Message { id, message } => {
                    assert_eq!(id, WorkerId::new(900));
                    seen.push(message.heartbeat().unwrap().memory);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        seen
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_skips_malformed_and_plain_lines() {
        let first = heartbeat(1);
        let last = heartbeat(2);
        let malformed = format!("{}{{\"type\":\"heartbeat\",\"slot\":\n", LINE_PREFIX);
        let stdout = Builder::new()
            .read(first.as_bytes())
            .read(malformed.as_bytes())
            .read(b"listening on 0.0.0.0:8080\n")
            .read(last.as_bytes())
            .build();

        let (tx, mut rx) = mpsc::channel(8);
        forward_messages(stdout, WorkerId::new(900), tx).await;

        assert_eq!(memories(&mut rx), vec![1, 2]);
        assert!(logs_contain("worker_message_malformed"));
        assert!(logs_contain("listening on 0.0.0.0:8080"));
    }

    #[tokio::test]
    async fn test_joins_lines_split_across_reads() {
        let line = heartbeat(42);
        let (head, tail) = line.as_bytes().split_at(line.len() / 2);
        let stdout = Builder::new().read(head).read(tail).build();

        let (tx, mut rx) = mpsc::channel(8);
        forward_messages(stdout, WorkerId::new(900), tx).await;

        assert_eq!(memories(&mut rx), vec![42]);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_stops_on_read_error() {
        let first = heartbeat(7);
        let stdout = Builder::new()
            .read(first.as_bytes())
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
            .build();

        let (tx, mut rx) = mpsc::channel(8);
        forward_messages(stdout, WorkerId::new(900), tx).await;

        assert_eq!(memories(&mut rx), vec![7]);
        assert!(logs_contain("worker_stdout_read_failed"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_when_supervisor_is_gone() {
        let stdout = Builder::new().read(heartbeat(1).as_bytes()).build();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        forward_messages(stdout, WorkerId::new(900), tx).await;
    }
}
