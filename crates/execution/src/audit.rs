//! Append-only JSON-lines audit trail.
//!
//! One file per UTC day, `audit-YYYY-MM-DD.jsonl`. A file that grows past the
//! size limit is renamed to `audit-YYYY-MM-DD.<n>.jsonl` and a fresh one is
//! started. Writing is best-effort: a failed write is logged, never raised.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use neuroinsight_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Rotation threshold (50 MiB).
pub const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    JobSubmitted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    JobDeleted,
    JobReattached,
    SshConnected,
    SshDisconnected,
    BackendSwitched,
    FileDownloaded,
    RegistryReloaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub details: Value,
}

pub struct AuditLog {
    dir: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_max_bytes(dir, MAX_FILE_BYTES)
    }

    pub fn with_max_bytes(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one entry.
    pub async fn record(&self, event: AuditEvent, job_id: Option<JobId>, details: Value) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            job_id,
            details,
        };
        if let Err(e) = self.append(&entry).await {
            tracing::warn!(event = ?event, error = %e, dir = %self.dir.display(), "Failed to write audit entry");
        }
    }

    async fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let date = entry.timestamp.date_naive();
        let path = self.current_file(date);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.len() + line.len() as u64 > self.max_bytes {
                let rotated = self.next_rotated_file(date).await?;
                tokio::fs::rename(&path, &rotated).await?;
                tracing::info!(file = %rotated.display(), "Rotated audit log");
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }

    /// Most recent entries from today and yesterday, newest first.
    pub async fn recent(
        &self,
        limit: usize,
        event: Option<AuditEvent>,
    ) -> std::io::Result<Vec<AuditEntry>> {
        let today = Utc::now().date_naive();
        let mut entries = Vec::new();
        for date in [today.pred_opt(), Some(today)].into_iter().flatten() {
            for path in self.files_for(date).await? {
                let text = match tokio::fs::read_to_string(&path).await {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                entries.extend(
                    text.lines()
                        .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
                        .filter(|e| event.map_or(true, |wanted| wanted == e.event)),
                );
            }
        }
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    fn current_file(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{date}.jsonl"))
    }

    /// Rotated parts of `date` in order, followed by the current file.
    async fn files_for(&self, date: NaiveDate) -> std::io::Result<Vec<PathBuf>> {
        let mut parts: Vec<(u32, PathBuf)> = Vec::new();
        let prefix = format!("audit-{date}.");
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let index = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".jsonl"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(index) = index {
                parts.push((index, entry.path()));
            }
        }
        parts.sort();
        let mut files: Vec<PathBuf> = parts.into_iter().map(|(_, p)| p).collect();
        files.push(self.current_file(date));
        Ok(files)
    }

    async fn next_rotated_file(&self, date: NaiveDate) -> std::io::Result<PathBuf> {
        let existing = self.files_for(date).await?.len();
        // `files_for` always includes the current file.
        Ok(self.dir.join(format!("audit-{date}.{existing}.jsonl")))
    }
}
