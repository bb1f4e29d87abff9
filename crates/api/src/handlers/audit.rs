use axum::extract::{Query, State};
use axum::Json;
use neuroinsight_execution::{AuditEntry, AuditEvent};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub limit: Option<usize>,
    pub event: Option<AuditEvent>,
}

/// GET /api/v1/audit
///
/// Entries from today and yesterday, newest first.
pub async fn recent_entries(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> AppResult<Json<DataResponse<Vec<AuditEntry>>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let entries = state
        .audit()
        .recent(limit, params.event)
        .await
        .map_err(|e| AppError::InternalError(format!("Reading audit log: {e}")))?;
    Ok(Json(DataResponse { data: entries }))
}
