//! Handlers for the remote session, cluster queries and backend selection.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use neuroinsight_core::error::CoreError;
use neuroinsight_core::hpc::{partition_presets, AccountAssociation, Partition, PartitionPresets, QueueEntry};
use neuroinsight_core::status::BackendType;
use neuroinsight_execution::{AuditEvent, BackendSelection, HpcSettings};
use neuroinsight_remote::info::{DirectoryListing, SystemInfo};
use neuroinsight_remote::{ConnectionStatus, HealthReport, SshTarget};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of `POST /hpc/connect`. Missing fields fall back to `HPC_HOST`,
/// `HPC_USER` and `HPC_PORT`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub host: Option<String>,
    pub username: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PresetParams {
    pub partition: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BrowseParams {
    /// Defaults to the cluster working directory.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub remote_path: String,
}

/// Body of `POST /hpc/backend/switch`.
#[derive(Debug, Deserialize)]
pub struct SwitchBackend {
    pub backend_type: BackendType,
    /// Replaces the cluster defaults when present.
    #[serde(default)]
    pub hpc: Option<HpcSettings>,
}

#[derive(Debug, Serialize)]
pub struct CurrentBackend {
    #[serde(flatten)]
    pub selection: BackendSelection,
    pub connected: bool,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// POST /api/v1/hpc/connect
///
/// Authenticates with the local SSH agent only. Replaces any open session;
/// remote jobs are re-attached to the new one.
pub async fn connect(
    State(state): State<AppState>,
    body: Option<Json<ConnectRequest>>,
) -> AppResult<Json<DataResponse<ConnectionStatus>>> {
    let input = body.map(|Json(b)| b).unwrap_or_default();
    let config = &state.config;

    let host = input
        .host
        .or_else(|| config.hpc_host.clone())
        .ok_or_else(|| AppError::BadRequest("host is required".into()))?;
    let username = input
        .username
        .or_else(|| config.hpc_user.clone())
        .ok_or_else(|| AppError::BadRequest("username is required".into()))?;
    let target = SshTarget {
        host,
        username,
        port: input.port.unwrap_or(config.hpc_port),
    };

    let status = state.connections().connect(target.clone()).await?;
    state
        .audit()
        .record(
            AuditEvent::SshConnected,
            None,
            json!({ "target": target.to_string(), "generation": status.generation }),
        )
        .await;

    Ok(Json(DataResponse { data: status }))
}

/// POST /api/v1/hpc/disconnect
///
/// Remote jobs keep running; they are re-attached on the next connect.
pub async fn disconnect(State(state): State<AppState>) -> Json<DataResponse<serde_json::Value>> {
    let target = state.connections().target().await;
    let disconnected = state.connections().disconnect().await;
    if disconnected {
        state
            .audit()
            .record(
                AuditEvent::SshDisconnected,
                None,
                json!({ "target": target.map(|t| t.to_string()), "reason": "user" }),
            )
            .await;
    }
    Json(DataResponse {
        data: json!({ "disconnected": disconnected }),
    })
}

/// GET /api/v1/hpc/status
pub async fn status(State(state): State<AppState>) -> Json<DataResponse<ConnectionStatus>> {
    let status = state.connections().status().await;
    Json(DataResponse { data: status })
}

/// GET /api/v1/hpc/health
pub async fn health(State(state): State<AppState>) -> Json<DataResponse<HealthReport>> {
    let report = state.connections().health_check().await;
    Json(DataResponse { data: report })
}

/// GET /api/v1/hpc/system-info
pub async fn system_info(State(state): State<AppState>) -> AppResult<Json<DataResponse<SystemInfo>>> {
    let info = state.connections().system_info().await?;
    Ok(Json(DataResponse { data: info }))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// GET /api/v1/hpc/partitions
pub async fn partitions(State(state): State<AppState>) -> AppResult<Json<DataResponse<Vec<Partition>>>> {
    let partitions = state.connections().list_partitions().await?;
    Ok(Json(DataResponse { data: partitions }))
}

/// GET /api/v1/hpc/queue
pub async fn queue(State(state): State<AppState>) -> AppResult<Json<DataResponse<Vec<QueueEntry>>>> {
    let entries = state.connections().list_queue().await?;
    Ok(Json(DataResponse { data: entries }))
}

/// GET /api/v1/hpc/accounts
///
/// Only meaningful while Slurm is the selected backend.
pub async fn accounts(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<AccountAssociation>>>> {
    let backend = state.jobs.current_backend().await.backend_type;
    if backend != BackendType::Slurm {
        return Err(AppError::BadRequest(format!(
            "Account information requires the slurm backend; current backend is {}",
            backend.as_str()
        )));
    }
    let accounts = state.connections().list_accounts().await?;
    Ok(Json(DataResponse { data: accounts }))
}

/// GET /api/v1/hpc/resource-presets
///
/// Uses the partitions cached on the session, querying the scheduler only
/// when none are cached yet.
pub async fn resource_presets(
    State(state): State<AppState>,
    Query(params): Query<PresetParams>,
) -> AppResult<Json<DataResponse<Vec<PartitionPresets>>>> {
    let mut partitions = state.connections().cached_partitions().await;
    if partitions.is_empty() {
        partitions = state.connections().list_partitions().await?;
    }

    let presets: Vec<PartitionPresets> = partitions
        .iter()
        .filter(|p| params.partition.as_deref().map_or(true, |name| p.name == name))
        .map(partition_presets)
        .collect();

    if let (Some(name), true) = (params.partition, presets.is_empty()) {
        return Err(CoreError::not_found("Partition", name).into());
    }
    Ok(Json(DataResponse { data: presets }))
}

// ---------------------------------------------------------------------------
// Remote files
// ---------------------------------------------------------------------------

/// GET /api/v1/hpc/browse
pub async fn browse(
    State(state): State<AppState>,
    Query(params): Query<BrowseParams>,
) -> AppResult<Json<DataResponse<DirectoryListing>>> {
    let path = match params.path.filter(|p| !p.trim().is_empty()) {
        Some(path) => path,
        None => state.jobs.current_backend().await.hpc.work_dir,
    };
    let listing = state.connections().browse(&path).await?;
    Ok(Json(DataResponse { data: listing }))
}

/// GET /api/v1/hpc/file/download
///
/// Copies the file into `<DATA_DIR>/downloads/` and returns its bytes as an
/// attachment.
pub async fn download_file(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> AppResult<impl IntoResponse> {
    let file_name = std::path::Path::new(&params.remote_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("Not a file path: {}", params.remote_path)))?;

    let local_path = state
        .config
        .execution
        .data_dir
        .join("downloads")
        .join(&file_name);
    let size = state
        .connections()
        .download(&params.remote_path, &local_path)
        .await?;
    let bytes = tokio::fs::read(&local_path)
        .await
        .map_err(|e| AppError::InternalError(format!("{}: {e}", local_path.display())))?;

    tracing::info!(remote_path = %params.remote_path, size, "Remote file downloaded");
    state
        .audit()
        .record(
            AuditEvent::FileDownloaded,
            None,
            json!({
                "remote_path": params.remote_path,
                "local_path": local_path.display().to_string(),
                "size_bytes": size,
            }),
        )
        .await;

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

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// POST /api/v1/hpc/backend/switch
///
/// Only affects jobs submitted afterwards. Remote backends require an open
/// session.
pub async fn switch_backend(
    State(state): State<AppState>,
    Json(input): Json<SwitchBackend>,
) -> AppResult<Json<DataResponse<CurrentBackend>>> {
    let hpc = match input.hpc {
        Some(hpc) => hpc,
        None => state.jobs.current_backend().await.hpc,
    };
    let selection = state
        .jobs
        .switch_backend(BackendSelection {
            backend_type: input.backend_type,
            hpc,
        })
        .await?;
    let connected = state.connections().is_connected().await;
    Ok(Json(DataResponse {
        data: CurrentBackend { selection, connected },
    }))
}

/// GET /api/v1/hpc/backend/current
pub async fn current_backend(State(state): State<AppState>) -> Json<DataResponse<CurrentBackend>> {
    let selection = state.jobs.current_backend().await;
    let connected = state.connections().is_connected().await;
    Json(DataResponse {
        data: CurrentBackend { selection, connected },
    })
}
