//! Attempt logs and per-URL access records.
//!
//! Attempts are appended as they happen, one JSON object per line, so a
//! crash mid-loop still leaves every finished attempt on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::access::{AccessAttempt, AccessOutcome, AccessPlan, Strategy, TerminalReason};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Line written to the attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLine {
    pub url: String,
    #[serde(flatten)]
    pub attempt: AccessAttempt,
}

/// Receives each attempt the moment it is classified.
#[async_trait]
pub trait AttemptSink: Send + Sync {
    async fn append(&self, url: &str, attempt: &AccessAttempt) -> Result<(), RecordError>;
}

/// Final record for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub url: String,
    pub domain: String,
    pub plan: AccessPlan,
    pub attempts: Vec<AccessAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_outcome: Option<AccessOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_strategy: Option<Strategy>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    /// Routed to the manual-review queue.
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub perpetual_manual: bool,
    pub completed_at: DateTime<Utc>,
}

impl AccessRecord {
    /// Distinct strategies used, in ladder order.
    pub fn strategies_used(&self) -> Vec<Strategy> {
        let mut used: Vec<Strategy> = self.attempts.iter().map(|a| a.strategy).collect();
        used.sort();
        used.dedup();
        used
    }
}

/// Append-only JSON Lines file.
pub struct JsonlFile {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlFile {
    /// Open `path` for appending, creating it and its parent directory.
    pub async fn open(path: &Path) -> Result<Self, RecordError> {
        let io_err = |source| RecordError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `value` as one line and flush it.
    pub async fn append_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), RecordError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        let io_err = |source| RecordError::Io {
            path: self.path.display().to_string(),
            source,
        };
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }
}

#[async_trait]
impl AttemptSink for JsonlFile {
    async fn append(&self, url: &str, attempt: &AccessAttempt) -> Result<(), RecordError> {
        self.append_json(&AttemptLine {
            url: url.to_string(),
            attempt: attempt.clone(),
        })
        .await
    }
}

/// Keeps attempts in memory. Used by tests and `--dry-run` style callers.
#[derive(Default)]
pub struct MemoryAttemptLog {
    lines: Mutex<Vec<AttemptLine>>,
}

impl MemoryAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lines(&self) -> Vec<AttemptLine> {
        self.lines.lock().await.clone()
    }

    /// Attempts logged for one URL, in append order.
    pub async fn for_url(&self, url: &str) -> Vec<AccessAttempt> {
        self.lines
            .lock()
            .await
            .iter()
            .filter(|line| line.url == url)
            .map(|line| line.attempt.clone())
            .collect()
    }
}

#[async_trait]
impl AttemptSink for MemoryAttemptLog {
    async fn append(&self, url: &str, attempt: &AccessAttempt) -> Result<(), RecordError> {
        self.lines.lock().await.push(AttemptLine {
            url: url.to_string(),
            attempt: attempt.clone(),
        });
        Ok(())
    }
}
