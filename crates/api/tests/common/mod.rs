#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use neuroinsight_core::resources::HostLimits;
use neuroinsight_execution::testing::{sample_registry, ScriptedRunner};
use neuroinsight_execution::{AuditLog, ExecutionSettings, HpcSettings, JobManager};
use neuroinsight_remote::testing::{ScriptedConnector, ScriptedSession};
use neuroinsight_remote::{ConnectionManager, SshSettings};
use tempfile::TempDir;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;

use neuroinsight_api::app::build_router;
use neuroinsight_api::config::ServerConfig;
use neuroinsight_api::state::AppState;

/// A full application over an in-memory database, a scripted container
/// engine and a scripted SSH session.
pub struct TestApp {
    pub dir: TempDir,
    pub runner: Arc<ScriptedRunner>,
    pub session: Arc<ScriptedSession>,
    pub jobs: Arc<JobManager>,
    state: AppState,
}

/// Build a test `ServerConfig` rooted at `dir`, with fast polling.
pub fn test_config(dir: &TempDir) -> ServerConfig {
    let data_dir = dir.path().join("data");
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        database_url: "sqlite::memory:".to_string(),
        plugins_dir: dir.path().join("plugins"),
        workflows_dir: dir.path().join("workflows"),
        audit_dir: dir.path().join("audit"),
        log_json: false,
        execution: ExecutionSettings {
            data_dir,
            status_poll: Duration::from_millis(10),
            refresh_poll: Duration::from_millis(10),
            stale_after: Duration::from_secs(5),
            orphan_after: Duration::from_secs(30),
            local_limits: HostLimits {
                max_cpus: 8,
                max_memory_gb: 32,
                gpu_available: false,
                max_time_hours: None,
            },
            ..ExecutionSettings::default()
        },
        backend_type: neuroinsight_core::status::BackendType::Local,
        hpc: HpcSettings::default(),
        hpc_host: Some("login.hpc.example.org".to_string()),
        hpc_user: Some("alice".to_string()),
        hpc_port: 22,
        ssh: SshSettings::default(),
        ssh_idle_timeout: None,
    }
}

impl TestApp {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let pool = neuroinsight_db::create_memory_pool().await.unwrap();
        neuroinsight_db::run_migrations(&pool).await.unwrap();

        let registry = Arc::new(sample_registry(dir.path()));
        let session = Arc::new(ScriptedSession::new());
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(ScriptedConnector::new(Arc::clone(&session))),
            Duration::from_secs(5),
        ));
        let runner = Arc::new(ScriptedRunner::new());
        let jobs = Arc::new(
            JobManager::new(
                pool.clone(),
                registry,
                connections,
                runner.clone(),
                Arc::new(AuditLog::new(&config.audit_dir)),
                config.execution.clone(),
            )
            .with_selection(config.initial_selection()),
        );

        let state = AppState {
            pool,
            config: Arc::new(config),
            jobs: Arc::clone(&jobs),
        };
        Self {
            dir,
            runner,
            session,
            jobs,
            state,
        }
    }

    /// The router with the production middleware stack.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(["http://localhost:5173".parse().unwrap()]);
        build_router(self.state.clone(), cors)
    }

    /// Write an input file under the temp dir and return its path.
    pub fn input(&self, name: &str) -> String {
        let path = self.dir.path().join("inputs").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, name.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: serde_json::Value) -> Response {
        self.send(Method::POST, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> Response {
        self.send(Method::DELETE, uri, None).await
    }

    async fn send(&self, method: Method, uri: &str, body: Option<serde_json::Value>) -> Response {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        self.router().oneshot(request).await.unwrap()
    }

    /// Poll `GET /api/v1/jobs/{id}` until the job reaches `status`.
    pub async fn wait_for_status(&self, id: &str, status: &str) -> serde_json::Value {
        let uri = format!("/api/v1/jobs/{id}");
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let json = body_json(self.get(&uri).await).await;
                if json["data"]["status"] == status {
                    return json["data"].clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        match waited {
            Ok(job) => job,
            Err(_) => panic!("job {id} never reached {status}"),
        }
    }
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Assert the status and return the JSON body.
pub async fn expect_json(response: Response, status: StatusCode) -> serde_json::Value {
    assert_eq!(response.status(), status);
    body_json(response).await
}
