//! Output manifest rows.

use neuroinsight_core::outputs::{FileKind, OutputFile};
use neuroinsight_core::types::{JobId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `job_outputs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobOutput {
    pub id: i64,
    pub job_id: JobId,
    /// Path relative to the job's output directory.
    pub path: String,
    pub size_bytes: i64,
    pub kind: String,
    pub created_at: Timestamp,
}

impl JobOutput {
    pub fn kind(&self) -> FileKind {
        FileKind::parse(&self.kind)
    }
}

impl From<JobOutput> for OutputFile {
    fn from(row: JobOutput) -> Self {
        OutputFile {
            kind: row.kind(),
            path: row.path,
            size_bytes: u64::try_from(row.size_bytes).unwrap_or(0),
        }
    }
}
