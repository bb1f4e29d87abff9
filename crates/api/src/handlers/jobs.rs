//! Handlers for the `/jobs` resource.
//!
//! All state changes go through the [`JobManager`](neuroinsight_execution::JobManager);
//! handlers only translate between HTTP and its operations.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use neuroinsight_core::provenance::ProvenanceRecord;
use neuroinsight_core::resolve::JobRequest;
use neuroinsight_core::status::BackendType;
use neuroinsight_core::types::JobId;
use neuroinsight_db::models::job::{Job, JobListQuery, JobProgress};
use neuroinsight_db::models::output::JobOutput;
use neuroinsight_execution::{BatchRequest, JobLogs};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJob {
    #[serde(flatten)]
    pub request: JobRequest,
    /// Overrides the active backend for this job only.
    #[serde(default)]
    pub backend_type: Option<BackendType>,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Validate, resolve and submit one job. Returns 201 with the job in
/// `pending`. Nothing is stored when validation or the session check fails.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    let job = state.jobs.submit_request(input.request, input.backend_type).await?;

    tracing::info!(
        job_id = %job.id,
        backend = %job.backend_type(),
        unit = ?job.plugin_id.as_deref().or(job.workflow_id.as_deref()),
        "Job submitted",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

/// POST /api/v1/jobs/batch
///
/// One job per file in `directory` matching `pattern`. Files that fail
/// validation are listed under `errors`; the rest are submitted.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(input): Json<BatchRequest>,
) -> AppResult<impl IntoResponse> {
    let submission = state.jobs.submit_batch(input).await?;

    tracing::info!(
        batch_id = %submission.batch_id,
        jobs = submission.jobs.len(),
        errors = submission.errors.len(),
        "Batch submitted",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: submission })))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<Json<DataResponse<Vec<Job>>>> {
    let jobs = state.jobs.list(&params).await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/progress
///
/// Cheap rows for the fast polling tier: progress, phase and staleness of
/// every unfinished job.
pub async fn list_progress(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<JobProgress>>>> {
    let progress = state.jobs.list_progress().await?;
    Ok(Json(DataResponse { data: progress }))
}

/// GET /api/v1/jobs/batch/{batch_id}
pub async fn list_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<JobId>,
) -> AppResult<Json<DataResponse<Vec<Job>>>> {
    let jobs = state.jobs.list_batch(batch_id).await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<DataResponse<Job>>> {
    let job = state.jobs.get(id).await?;
    Ok(Json(DataResponse { data: job }))
}

/// GET /api/v1/jobs/{id}/logs
pub async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<DataResponse<JobLogs>>> {
    let logs = state.jobs.logs(id).await?;
    Ok(Json(DataResponse { data: logs }))
}

/// GET /api/v1/jobs/{id}/outputs
pub async fn job_outputs(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<DataResponse<Vec<JobOutput>>>> {
    let outputs = state.jobs.outputs(id).await?;
    Ok(Json(DataResponse { data: outputs }))
}

#[derive(Debug, Deserialize)]
pub struct OutputDownloadParams {
    /// Relative to the job's output directory.
    pub path: String,
}

/// GET /api/v1/jobs/{id}/outputs/download
pub async fn download_output(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(params): Query<OutputDownloadParams>,
) -> AppResult<impl IntoResponse> {
    let (file_name, bytes) = state.jobs.output_file(id, &params.path).await?;
    tracing::debug!(job_id = %id, path = %params.path, size = bytes.len(), "Output file served");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name.replace('"', "")),
            ),
        ],
        bytes,
    ))
}

/// GET /api/v1/jobs/{id}/metrics
pub async fn job_metrics(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<DataResponse<Value>>> {
    let metrics = state.jobs.metrics(id).await?;
    Ok(Json(DataResponse { data: metrics }))
}

/// GET /api/v1/jobs/{id}/provenance
pub async fn job_provenance(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<DataResponse<ProvenanceRecord>>> {
    let record = state.jobs.provenance(id).await?;
    Ok(Json(DataResponse { data: record }))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Returns the cancelled job, or 409 `ALREADY_TERMINAL` when the job ended
/// first. The status of a finished job is never changed.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<Json<DataResponse<Job>>> {
    let job = state.jobs.cancel(id).await?;
    tracing::info!(job_id = %id, "Job cancelled");
    Ok(Json(DataResponse { data: job }))
}

/// DELETE /api/v1/jobs/{id}
///
/// Removes the record of a finished job. Output files stay on disk.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<StatusCode> {
    state.jobs.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
