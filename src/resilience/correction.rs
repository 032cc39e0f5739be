//! Correction log: audit trail of terminal failures and recoveries.
//!
//! Writes are best-effort. Callers log and swallow append errors so the
//! resilience layer never fails because its own bookkeeping did.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::types::{Error, Result};

/// Outcome recorded for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionStatus {
    Success,
    Failed,
}

/// One append-only correction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEntry {
    pub context: String,
    pub error: String,
    pub attempts: u32,
    pub status: CorrectionStatus,
    pub timestamp: DateTime<Utc>,
}

impl CorrectionEntry {
    pub fn failed(context: &str, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            context: context.to_string(),
            error: error.into(),
            attempts,
            status: CorrectionStatus::Failed,
            timestamp: Utc::now(),
        }
    }

    pub fn recovered(context: &str, last_error: impl Into<String>, attempts: u32) -> Self {
        Self {
            context: context.to_string(),
            error: last_error.into(),
            attempts,
            status: CorrectionStatus::Success,
            timestamp: Utc::now(),
        }
    }
}

/// Storage collaborator receiving correction records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CorrectionLog: Send + Sync + std::fmt::Debug {
    async fn append(&self, entry: &CorrectionEntry) -> Result<()>;
}

/// JSON-lines file sink, one record per line.
#[derive(Debug, Clone)]
pub struct JsonlCorrectionLog {
    path: PathBuf,
}

impl JsonlCorrectionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CorrectionLog for JsonlCorrectionLog {
    async fn append(&self, entry: &CorrectionEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Entries kept by [`MemoryCorrectionLog::new`].
pub const DEFAULT_RETAINED_CORRECTIONS: usize = 1024;

/// In-process sink, used when no log file is configured.
///
/// Keeps the most recent `capacity` entries; older ones are dropped.
#[derive(Debug)]
pub struct MemoryCorrectionLog {
    capacity: usize,
    entries: Mutex<VecDeque<CorrectionEntry>>,
}

impl MemoryCorrectionLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RETAINED_CORRECTIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<CorrectionEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryCorrectionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CorrectionLog for MemoryCorrectionLog {
    async fn append(&self, entry: &CorrectionEntry) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("correction log mutex poisoned"))?;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Ok(())
    }
}
