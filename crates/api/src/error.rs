use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use neuroinsight_core::error::CoreError;
use neuroinsight_execution::ExecutionError;
use neuroinsight_remote::ConnectionError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps the domain, execution and connection errors and adds HTTP-specific
/// variants. Implements [`IntoResponse`] to produce consistent JSON error
/// responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Failure of a direct remote-session operation (browse, connect, ...).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

type Classified = (StatusCode, &'static str, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core(core),
            AppError::Execution(err) => classify_execution(err),
            AppError::Connection(err) => classify_connection(err),
            AppError::Database(err) => classify_sqlx_error(err),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => internal(msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal(detail: &dyn std::fmt::Display) -> Classified {
    tracing::error!(error = %detail, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

fn classify_core(err: &CoreError) -> Classified {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        CoreError::Internal(msg) => internal(msg),
    }
}

fn classify_execution(err: &ExecutionError) -> Classified {
    match err {
        ExecutionError::Core(core) => classify_core(core),
        ExecutionError::Connection(conn) => classify_connection(conn),
        ExecutionError::Database(db) => classify_sqlx_error(db),
        ExecutionError::AlreadyTerminal { .. } => {
            (StatusCode::CONFLICT, "ALREADY_TERMINAL", err.to_string())
        }
        ExecutionError::Backend(_) => upstream("BACKEND_ERROR", err, "Backend operation failed".into()),
        ExecutionError::CommandFailed { exit_code, .. } => upstream(
            "BACKEND_ERROR",
            err,
            format!("Backend command exited with status {exit_code}"),
        ),
        ExecutionError::Io(e) => internal(e),
    }
}

/// 502 with a fixed summary. Remote output and stderr only go to the log.
fn upstream(code: &'static str, detail: &dyn std::fmt::Display, summary: String) -> Classified {
    tracing::warn!(error = %detail, code, "Upstream operation failed");
    (StatusCode::BAD_GATEWAY, code, summary)
}

/// Session availability problems are 503 so clients know to reconnect.
/// Missing and forbidden remote paths name the path the caller asked for.
fn classify_connection(err: &ConnectionError) -> Classified {
    match err {
        ConnectionError::NotConnected
        | ConnectionError::ConnectionLost(_)
        | ConnectionError::SessionRetired { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT_CONNECTED",
            err.to_string(),
        ),
        ConnectionError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        ConnectionError::PermissionDenied(_) => {
            (StatusCode::FORBIDDEN, "PERMISSION_DENIED", err.to_string())
        }
        ConnectionError::Connect(_) => upstream("REMOTE_ERROR", err, "Could not reach the remote host".into()),
        ConnectionError::Auth(_) => upstream("REMOTE_ERROR", err, "Remote authentication failed".into()),
        ConnectionError::Channel(_) => upstream("REMOTE_ERROR", err, "Remote command failed".into()),
        ConnectionError::Sftp(_) => upstream("REMOTE_ERROR", err, "Remote file transfer failed".into()),
        ConnectionError::Timeout(secs) => upstream(
            "REMOTE_ERROR",
            err,
            format!("Remote operation timed out after {secs}s"),
        ),
    }
}

/// Classify a sqlx error into an HTTP status, error code, and message.
///
/// - `RowNotFound` maps to 404.
/// - SQLite unique / primary key violations map to 409.
/// - Everything else maps to 500 with a sanitized message.
fn classify_sqlx_error(err: &sqlx::Error) -> Classified {
    match err {
        sqlx::Error::RowNotFound => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        ),
        // SQLITE_CONSTRAINT_UNIQUE (2067), SQLITE_CONSTRAINT_PRIMARYKEY (1555)
        sqlx::Error::Database(db_err)
            if matches!(db_err.code().as_deref(), Some("2067") | Some("1555")) =>
        {
            (
                StatusCode::CONFLICT,
                "CONFLICT",
                "Duplicate value violates a unique constraint".to_string(),
            )
        }
        other => internal(other),
    }
}
