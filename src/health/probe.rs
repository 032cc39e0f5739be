//! Resource probes.
//!
//! `SysinfoProbe` reads host memory, load average and per-process usage.
//! Tests substitute a fixed probe through the `ResourceProbe` trait.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::types::{ProcessSample, SystemSample};
use crate::types::WorkerId;

/// Source of resource samples.
pub trait ResourceProbe: Send + Sync + std::fmt::Debug {
    /// Host memory and load average.
    fn system(&self) -> SystemSample;

    /// Memory and CPU of one process, `None` if it no longer exists.
    fn process(&self, id: WorkerId) -> Option<ProcessSample>;

    /// Sample the calling process.
    fn current_process(&self) -> Option<ProcessSample> {
        self.process(WorkerId::new(std::process::id()))
    }
}

/// Probe backed by the `sysinfo` crate.
///
/// CPU usage is computed between refreshes, so the first sample of a
/// process reports 0.
#[derive(Debug)]
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn system(&self) -> SystemSample {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();
        let load = System::load_average();
        SystemSample {
            total_memory: sys.total_memory(),
            free_memory: sys.free_memory(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }

    fn process(&self, id: WorkerId) -> Option<ProcessSample> {
        let pid = Pid::from_u32(id.get());
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        sys.process(pid).map(|process| ProcessSample {
            memory: process.memory(),
            cpu: process.cpu_usage(),
        })
    }
}

/// Probe returning values set by the caller.
#[derive(Debug, Default)]
pub struct StaticProbe {
    system: Mutex<SystemSample>,
    current: Mutex<Option<ProcessSample>>,
    processes: Mutex<HashMap<WorkerId, ProcessSample>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_system(&self, sample: SystemSample) {
        *self.system.lock().unwrap_or_else(PoisonError::into_inner) = sample;
    }

    pub fn set_current(&self, sample: ProcessSample) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
    }

    pub fn set_process(&self, id: WorkerId, sample: ProcessSample) {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sample);
    }
}

impl ResourceProbe for StaticProbe {
    fn system(&self) -> SystemSample {
        *self.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, id: WorkerId) -> Option<ProcessSample> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    fn current_process(&self) -> Option<ProcessSample> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
