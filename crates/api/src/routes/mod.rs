pub mod audit;
pub mod health;
pub mod hpc;
pub mod jobs;
pub mod registry;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /plugins                          list (?user_selectable_only)
/// /plugins/{id}                     get
/// /workflows                        list (?user_selectable_only)
/// /workflows/{id}                   get
/// /registry/reload                  re-read definition files (POST)
/// /registry/lock                    lockfile of loaded definitions (GET)
/// /registry/lock/verify             compare a pinned lockfile (POST)
///
/// /jobs                             list (?status, limit, offset), submit
/// /jobs/batch                       submit one job per matching file (POST)
/// /jobs/batch/{batch_id}            jobs of one batch (GET)
/// /jobs/progress                    progress of active jobs (GET)
/// /jobs/{id}                        get, delete
/// /jobs/{id}/cancel                 cancel (POST)
/// /jobs/{id}/logs                   stdout / stderr
/// /jobs/{id}/outputs                output manifest
/// /jobs/{id}/metrics                aggregated metrics
/// /jobs/{id}/provenance             provenance record
///
/// /hpc/connect                      open the SSH session (POST)
/// /hpc/disconnect                   close it (POST)
/// /hpc/status                       connection status
/// /hpc/health                       round-trip check
/// /hpc/system-info                  remote host capacity
/// /hpc/partitions                   scheduler partitions
/// /hpc/queue                        the user's scheduler queue
/// /hpc/resource-presets             presets per partition (?partition)
/// /hpc/browse                       remote directory listing (?path)
/// /hpc/file/download                fetch a remote file (?remote_path)
/// /hpc/backend/switch               select the backend for new jobs (POST)
/// /hpc/backend/current              active backend selection
///
/// /audit                            audit trail (?limit, event)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(registry::router())
        .nest("/jobs", jobs::router())
        .nest("/hpc", hpc::router())
        .nest("/audit", audit::router())
}
