//! Route definitions for the remote session and backend selection.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::hpc;
use crate::state::AppState;

/// Routes mounted at `/hpc`.
///
/// ```text
/// POST   /connect             -> connect
/// POST   /disconnect          -> disconnect
/// GET    /status              -> status
/// GET    /health              -> health
/// GET    /system-info         -> system_info
/// GET    /partitions          -> partitions
/// GET    /queue               -> queue
/// GET    /accounts            -> accounts
/// GET    /resource-presets    -> resource_presets
/// GET    /browse              -> browse
/// GET    /file/download       -> download_file
/// POST   /backend/switch      -> switch_backend
/// GET    /backend/current     -> current_backend
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/connect", post(hpc::connect))
        .route("/disconnect", post(hpc::disconnect))
        .route("/status", get(hpc::status))
        .route("/health", get(hpc::health))
        .route("/system-info", get(hpc::system_info))
        .route("/partitions", get(hpc::partitions))
        .route("/queue", get(hpc::queue))
        .route("/accounts", get(hpc::accounts))
        .route("/resource-presets", get(hpc::resource_presets))
        .route("/browse", get(hpc::browse))
        .route("/file/download", get(hpc::download_file))
        .route("/backend/switch", post(hpc::switch_backend))
        .route("/backend/current", get(hpc::current_backend))
}
