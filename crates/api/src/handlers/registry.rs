//! Handlers for plugin and workflow definitions.
//!
//! Every request reads one registry snapshot; a concurrent reload never
//! mixes old and new definitions within a response.

use axum::extract::{Path, Query, State};
use axum::Json;
use neuroinsight_core::registry::{LockReport, Lockfile, PluginDefinition, Rejected, WorkflowDefinition};
use neuroinsight_execution::AuditEvent;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Hide definitions marked `visibility.user_selectable: false`.
    #[serde(default)]
    pub user_selectable_only: bool,
}

/// Result of a registry reload.
#[derive(Debug, Serialize)]
pub struct ReloadSummary {
    pub plugins: usize,
    pub workflows: usize,
    /// Files excluded by validation.
    pub rejected: Vec<Rejected>,
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// GET /api/v1/plugins
pub async fn list_plugins(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<DataResponse<Vec<PluginDefinition>>> {
    let registry = state.jobs.registry().snapshot();
    let plugins = registry
        .list_plugins(params.user_selectable_only)
        .into_iter()
        .cloned()
        .collect();
    Json(DataResponse { data: plugins })
}

/// GET /api/v1/plugins/{id}
pub async fn get_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<PluginDefinition>>> {
    let registry = state.jobs.registry().snapshot();
    let plugin = registry.get_plugin(&id)?.clone();
    Ok(Json(DataResponse { data: plugin }))
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// GET /api/v1/workflows
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<DataResponse<Vec<WorkflowDefinition>>> {
    let registry = state.jobs.registry().snapshot();
    let workflows = registry
        .list_workflows(params.user_selectable_only)
        .into_iter()
        .cloned()
        .collect();
    Json(DataResponse { data: workflows })
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<WorkflowDefinition>>> {
    let registry = state.jobs.registry().snapshot();
    let workflow = registry.get_workflow(&id)?.clone();
    Ok(Json(DataResponse { data: workflow }))
}

// ---------------------------------------------------------------------------
// Reload and lockfile
// ---------------------------------------------------------------------------

/// POST /api/v1/registry/reload
///
/// Re-reads both definition directories. Jobs already submitted keep the
/// spec they were resolved with.
pub async fn reload(State(state): State<AppState>) -> Json<DataResponse<ReloadSummary>> {
    let registry = state.jobs.registry().reload();
    let summary = ReloadSummary {
        plugins: registry.list_plugins(false).len(),
        workflows: registry.list_workflows(false).len(),
        rejected: registry.rejected().to_vec(),
    };

    tracing::info!(
        plugins = summary.plugins,
        workflows = summary.workflows,
        rejected = summary.rejected.len(),
        "Registry reloaded"
    );
    state
        .audit()
        .record(
            AuditEvent::RegistryReloaded,
            None,
            json!({
                "plugins": summary.plugins,
                "workflows": summary.workflows,
                "rejected": summary.rejected.len(),
            }),
        )
        .await;

    Json(DataResponse { data: summary })
}

/// GET /api/v1/registry/lock
pub async fn lockfile(State(state): State<AppState>) -> Json<DataResponse<Lockfile>> {
    let lock = state.jobs.registry().snapshot().lockfile();
    Json(DataResponse { data: lock })
}

/// POST /api/v1/registry/lock/verify
///
/// Compare a previously exported lockfile against the loaded definitions.
pub async fn verify_lock(
    State(state): State<AppState>,
    Json(pinned): Json<Lockfile>,
) -> Json<DataResponse<LockReport>> {
    let report = state.jobs.registry().snapshot().verify_lock(&pinned);
    Json(DataResponse { data: report })
}
