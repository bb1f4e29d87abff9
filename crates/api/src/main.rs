use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use neuroinsight_core::registry::RegistryHandle;
use neuroinsight_execution::{AuditLog, JobManager, ProcessRunner};
use neuroinsight_remote::{ConnectionManager, SshConnector};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use neuroinsight_api::app::{build_cors_layer, build_router};
use neuroinsight_api::background;
use neuroinsight_api::config::ServerConfig;
use neuroinsight_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid configuration");

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "neuroinsight_api=debug,neuroinsight_execution=debug,tower_http=debug".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Database ---
    std::fs::create_dir_all(&config.execution.data_dir).expect("Failed to create DATA_DIR");

    let pool = neuroinsight_db::create_pool(&config.database_url)
        .await
        .expect("Failed to open job database");
    tracing::info!(url = %config.database_url, "Database connection pool created");

    neuroinsight_db::health_check(&pool)
        .await
        .expect("Database health check failed");

    neuroinsight_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Registry ---
    let registry = Arc::new(RegistryHandle::load(&config.plugins_dir, &config.workflows_dir));
    {
        let snapshot = registry.snapshot();
        tracing::info!(
            plugins = snapshot.list_plugins(false).len(),
            workflows = snapshot.list_workflows(false).len(),
            rejected = snapshot.rejected().len(),
            "Definitions loaded"
        );
    }

    // --- Remote session ---
    let connections = Arc::new(ConnectionManager::new(
        Arc::new(SshConnector::new(config.ssh.clone())),
        config.execution.command_timeout,
    ));

    // --- Job manager ---
    let audit = Arc::new(AuditLog::new(&config.audit_dir));
    let jobs = Arc::new(
        JobManager::new(
            pool.clone(),
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::new(ProcessRunner),
            Arc::clone(&audit),
            config.execution.clone(),
        )
        .with_selection(config.initial_selection()),
    );
    jobs.start().await.expect("Failed to re-attach unfinished jobs");
    tracing::info!(supervised = jobs.supervised_jobs(), "Job manager started");

    // --- Background tasks ---
    let background_cancel = CancellationToken::new();
    let idle_handle = config.ssh_idle_timeout.map(|idle_timeout| {
        tokio::spawn(background::idle_disconnect::run(
            Arc::clone(&connections),
            Arc::clone(&audit),
            idle_timeout,
            background_cancel.clone(),
        ))
    });

    // --- Router ---
    let cors = build_cors_layer(&config).unwrap_or_else(|e| panic!("{e}"));
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        jobs: Arc::clone(&jobs),
    };
    let app = build_router(state, cors);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Supervision stops; containers and scheduler jobs keep running and are
    // re-attached on the next start.
    jobs.shutdown();

    background_cancel.cancel();
    if let Some(handle) = idle_handle {
        let _ = tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), handle).await;
    }

    connections.disconnect().await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
