//! Process supervision.
//!
//! One primary process keeps `workers` child processes running the service.
//! Workers report heartbeats and drain notices over stdout and signal their
//! intent through the exit code; the primary restarts them accordingly.

pub mod launcher;
pub mod primary;
pub mod protocol;
pub mod worker;

pub use launcher::{CommandLauncher, StopSignal, WorkerLauncher, SLOT_ENV};
pub use primary::{Supervisor, SupervisorEvent, SupervisorReport};
pub use protocol::{
    decode_line, encode_line, ExitKind, ShutdownReason, WorkerMessage, RESTART_EXIT_CODE,
};
pub use worker::{
    service_fn, slot_from_env, wait_for_termination, ChannelReporter, Reporter, ShutdownTrigger,
    StdoutReporter, WorkerExit, WorkerRuntime, WorkerService, TERMINATED_EXIT_CODE,
};
