use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the job store is unreachable.
    pub status: &'static str,
    pub version: &'static str,
    pub db_healthy: bool,
    pub ssh_connected: bool,
    /// Jobs currently watched by a supervision task.
    pub supervised_jobs: usize,
}

/// GET /health -- service, database and session health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = neuroinsight_db::health_check(&state.pool).await.is_ok();
    let status = if db_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        ssh_connected: state.connections().is_connected().await,
        supervised_jobs: state.jobs.supervised_jobs(),
    })
}

/// Mount health check routes (root-level, not under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
