//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// GET    /                    -> list_jobs
/// POST   /                    -> submit_job
/// POST   /batch               -> submit_batch
/// GET    /batch/{batch_id}    -> list_batch
/// GET    /progress            -> list_progress
/// GET    /{id}                -> get_job
/// DELETE /{id}                -> delete_job
/// POST   /{id}/cancel         -> cancel_job
/// GET    /{id}/logs           -> job_logs
/// GET    /{id}/outputs        -> job_outputs
/// GET    /{id}/outputs/download -> download_output
/// GET    /{id}/metrics        -> job_metrics
/// GET    /{id}/provenance     -> job_provenance
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/batch", post(jobs::submit_batch))
        .route("/batch/{batch_id}", get(jobs::list_batch))
        .route("/progress", get(jobs::list_progress))
        .route("/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/{id}/cancel", post(jobs::cancel_job))
        .route("/{id}/logs", get(jobs::job_logs))
        .route("/{id}/outputs", get(jobs::job_outputs))
        .route("/{id}/outputs/download", get(jobs::download_output))
        .route("/{id}/metrics", get(jobs::job_metrics))
        .route("/{id}/provenance", get(jobs::job_provenance))
}
