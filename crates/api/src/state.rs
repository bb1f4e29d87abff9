use std::sync::Arc;

use neuroinsight_execution::JobManager;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub pool: neuroinsight_db::DbPool,
    pub config: Arc<ServerConfig>,
    /// Job lifecycle manager. Also owns the registry, the connection
    /// manager and the audit log.
    pub jobs: Arc<JobManager>,
}

impl AppState {
    pub fn connections(&self) -> &Arc<neuroinsight_remote::ConnectionManager> {
        self.jobs.connections()
    }

    pub fn audit(&self) -> &Arc<neuroinsight_execution::AuditLog> {
        self.jobs.audit()
    }
}
