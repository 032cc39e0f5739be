//! Worker → primary messages and exit-code classification.
//!
//! Workers write one JSON object per stdout line, prefixed with
//! [`LINE_PREFIX`] so service output on the same stream is not mistaken for
//! protocol traffic:
//!
//! ```text
//! @warden:{"type":"heartbeat","slot":0,"pid":4242,"memory":31457280,"cpu":1.5}
//! @warden:{"type":"draining","slot":0,"pid":4242,"reason":{"kind":"memory_ceiling","bytes":480000000}}
//! ```

use serde::{Deserialize, Serialize};

use crate::health::WorkerHeartbeat;
use crate::types::{Result, WorkerId, WorkerSlot};

/// Marker preceding every protocol line.
pub const LINE_PREFIX: &str = "@warden:";

/// Exit code a worker uses to ask for a delayed replacement.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Why a worker entered graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT.
    Signal,
    /// The service panicked.
    Panic { message: String },
    /// The service returned an error.
    ServiceError { message: String },
    /// Resident memory crossed the configured ceiling.
    MemoryCeiling { bytes: u64 },
    /// The service returned on its own.
    ServiceExited,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "termination signal"),
            ShutdownReason::Panic { message } => write!(f, "panic: {}", message),
            ShutdownReason::ServiceError { message } => write!(f, "service error: {}", message),
            ShutdownReason::MemoryCeiling { bytes } => {
                write!(f, "memory ceiling exceeded ({} bytes)", bytes)
            }
            ShutdownReason::ServiceExited => write!(f, "service exited"),
        }
    }
}

/// Message sent from a worker to the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Heartbeat {
        slot: WorkerSlot,
        pid: WorkerId,
        memory: u64,
        cpu: f32,
    },
    Draining {
        slot: WorkerSlot,
        pid: WorkerId,
        reason: ShutdownReason,
    },
}

impl WorkerMessage {
    /// Heartbeat payload for the health monitor, if this is a heartbeat.
    pub fn heartbeat(&self) -> Option<WorkerHeartbeat> {
        match *self {
            WorkerMessage::Heartbeat {
                slot, memory, cpu, ..
            } => Some(WorkerHeartbeat { slot, memory, cpu }),
            WorkerMessage::Draining { .. } => None,
        }
    }
}

/// Encode a message as one protocol line (without newline).
pub fn encode_line(message: &WorkerMessage) -> Result<String> {
    Ok(format!("{}{}", LINE_PREFIX, serde_json::to_string(message)?))
}

/// Decode a protocol line. Returns `None` for lines without the prefix.
pub fn decode_line(line: &str) -> Option<Result<WorkerMessage>> {
    let payload = line.trim_end().strip_prefix(LINE_PREFIX)?;
    Some(serde_json::from_str(payload).map_err(Into::into))
}

/// How a worker process ended, from the primary's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0; the slot is left empty.
    Clean,
    /// [`RESTART_EXIT_CODE`]; replaced after the restart delay.
    RestartRequested,
    /// Any other code, or killed by a signal; replaced immediately.
    Crashed { code: i32 },
}

impl ExitKind {
    /// Classify an exit. A signal death maps to `128 + signal`.
    pub fn from_status(code: Option<i32>, signal: Option<i32>) -> Self {
        match (code, signal) {
            (Some(0), _) => ExitKind::Clean,
            (Some(RESTART_EXIT_CODE), _) => ExitKind::RestartRequested,
            (Some(code), _) => ExitKind::Crashed { code },
            (None, Some(signal)) => ExitKind::Crashed { code: 128 + signal },
            (None, None) => ExitKind::Crashed { code: -1 },
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ExitKind::Clean => 0,
            ExitKind::RestartRequested => RESTART_EXIT_CODE,
            ExitKind::Crashed { code } => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_heartbeat_line_layout() {
        let msg = WorkerMessage::Heartbeat {
            slot: WorkerSlot::new(2),
            pid: WorkerId::new(4242),
            memory: 1024,
            cpu: 0.5,
        };
        let line = encode_line(&msg).unwrap();
        assert!(line.starts_with(LINE_PREFIX));

        let json: serde_json::Value =
            serde_json::from_str(line.strip_prefix(LINE_PREFIX).unwrap()).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["slot"], 2);
        assert_eq!(json["pid"], 4242);

        let decoded = decode_line(&format!("{}\n", line)).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.heartbeat().unwrap().memory, 1024);
    }

    #[test]
    fn test_draining_reason_tagged() {
        let msg = WorkerMessage::Draining {
            slot: WorkerSlot::new(0),
            pid: WorkerId::new(1),
            reason: ShutdownReason::MemoryCeiling { bytes: 500 },
        };
        let line = encode_line(&msg).unwrap();
        assert!(line.contains(r#""kind":"memory_ceiling""#));
        assert!(decode_line(&line).unwrap().unwrap().heartbeat().is_none());
    }

    #[test]
    fn test_non_protocol_lines_ignored() {
        assert!(decode_line("listening on 0.0.0.0:5000").is_none());
        assert!(decode_line("").is_none());
    }

    #[test]
    fn test_malformed_protocol_line_is_error() {
        assert!(decode_line("@warden:{not json").unwrap().is_err());
    }

    #[test]
    fn test_exit_classification() {
        assert_eq!(ExitKind::from_status(Some(0), None), ExitKind::Clean);
        assert_eq!(
            ExitKind::from_status(Some(RESTART_EXIT_CODE), None),
            ExitKind::RestartRequested
        );
        assert_eq!(
            ExitKind::from_status(Some(1), None),
            ExitKind::Crashed { code: 1 }
        );
        assert_eq!(
            ExitKind::from_status(None, Some(15)),
            ExitKind::Crashed { code: 143 }
        );
        assert_eq!(ExitKind::from_status(None, Some(9)).code(), 137);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            ShutdownReason::MemoryCeiling { bytes: 10 }.to_string(),
            "memory ceiling exceeded (10 bytes)"
        );
        assert_eq!(ShutdownReason::Signal.to_string(), "termination signal");
    }
}
