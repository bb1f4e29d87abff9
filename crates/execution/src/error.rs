use neuroinsight_core::error::CoreError;
use neuroinsight_core::status::JobStatus;
use neuroinsight_remote::ConnectionError;

/// Errors raised by backends and the job lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Job is already {status}")]
    AlreadyTerminal { status: JobStatus },

    #[error("`{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    /// The job's session has been replaced by a newer one.
    pub fn is_session_retired(&self) -> bool {
        matches!(
            self,
            ExecutionError::Connection(ConnectionError::SessionRetired { .. })
        )
    }

    /// Build a [`ExecutionError::CommandFailed`] from a captured result.
    pub fn command_failed(command: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        ExecutionError::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: tail(stderr, 20),
        }
    }
}

/// The last `lines` non-empty lines of `text`.
pub fn tail(text: &str, lines: usize) -> String {
    let kept: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join("\n")
}
