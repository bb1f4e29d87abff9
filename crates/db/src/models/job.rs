//! Job entity models and DTOs.

use std::collections::BTreeMap;

use neuroinsight_core::job_spec::ResolvedJobSpec;
use neuroinsight_core::resources::ResourceAllocation;
use neuroinsight_core::status::{BackendType, JobStatus, StatusId};
use neuroinsight_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "backend_type", serialize_with = "backend_type_name")]
    pub backend_type_id: StatusId,
    pub backend_job_id: Option<String>,
    pub plugin_id: Option<String>,
    pub workflow_id: Option<String>,
    pub execution_mode: String,
    pub container_image: String,
    pub input_files: Json<Vec<String>>,
    pub parameters: Json<BTreeMap<String, Value>>,
    pub resources: Json<ResourceAllocation>,
    /// The full resolved spec the job was submitted with.
    #[serde(skip)]
    pub spec: Json<ResolvedJobSpec>,
    #[serde(rename = "status", serialize_with = "status_name")]
    pub status_id: StatusId,
    pub progress: i16,
    pub current_phase: Option<String>,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub output_dir: String,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub warnings: Json<Vec<String>>,
    pub metrics: Option<Json<Value>>,
    pub stale: bool,
    pub last_observed_at: Option<Timestamp>,
    pub session_generation: Option<i64>,
    /// `user@host:port` of the session a remote job was submitted through.
    pub session_target: Option<String>,
    pub batch_id: Option<JobId>,
    pub deleted_at: Option<Timestamp>,
}

impl Job {
    /// Decoded status. Rows are constrained to valid ids by the schema.
    pub fn status(&self) -> JobStatus {
        JobStatus::from_id(self.status_id).unwrap_or(JobStatus::Pending)
    }

    pub fn backend_type(&self) -> BackendType {
        BackendType::from_id(self.backend_type_id).unwrap_or(BackendType::Local)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// DTO for inserting a new pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub backend_type: BackendType,
    pub spec: ResolvedJobSpec,
    pub output_dir: String,
    pub session_generation: Option<i64>,
    pub session_target: Option<String>,
    pub batch_id: Option<JobId>,
}

/// Query parameters for `GET /api/v1/jobs`.
#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    /// Filter by status name (e.g. `running`).
    pub status: Option<JobStatus>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

/// Lightweight progress row for the fast polling tier.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobProgress {
    pub id: JobId,
    #[serde(rename = "status", serialize_with = "status_name")]
    pub status_id: StatusId,
    pub progress: i16,
    pub current_phase: Option<String>,
    pub stale: bool,
    pub last_observed_at: Option<Timestamp>,
}

/// Ids go over the wire by name.
fn status_name<S: serde::Serializer>(id: &StatusId, serializer: S) -> Result<S::Ok, S::Error> {
    match JobStatus::from_id(*id) {
        Some(status) => serializer.serialize_str(status.as_str()),
        None => serializer.serialize_i16(*id),
    }
}

fn backend_type_name<S: serde::Serializer>(id: &StatusId, serializer: S) -> Result<S::Ok, S::Error> {
    match BackendType::from_id(*id) {
        Some(backend) => serializer.serialize_str(backend.as_str()),
        None => serializer.serialize_i16(*id),
    }
}
