//! Route definitions for plugin and workflow definitions.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::registry;
use crate::state::AppState;

/// Routes merged at the `/api/v1` root.
///
/// ```text
/// GET    /plugins                -> list_plugins
/// GET    /plugins/{id}           -> get_plugin
/// GET    /workflows              -> list_workflows
/// GET    /workflows/{id}         -> get_workflow
/// POST   /registry/reload        -> reload
/// GET    /registry/lock          -> lockfile
/// POST   /registry/lock/verify   -> verify_lock
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/plugins", get(registry::list_plugins))
        .route("/plugins/{id}", get(registry::get_plugin))
        .route("/workflows", get(registry::list_workflows))
        .route("/workflows/{id}", get(registry::get_workflow))
        .route("/registry/reload", post(registry::reload))
        .route("/registry/lock", get(registry::lockfile))
        .route("/registry/lock/verify", post(registry::verify_lock))
}
