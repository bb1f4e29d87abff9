//! Transport-neutral view of one remote session.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ConnectionError;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size_bytes: u64,
    /// Modification time, seconds since the epoch.
    pub modified: Option<i64>,
}

/// Operations every remote session supports.
///
/// Implemented by the SSH transport and by the scripted test session.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command and capture its output.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ConnectionError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, ConnectionError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ConnectionError>;

    /// Create or truncate `path` and write `contents`.
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ConnectionError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

impl std::fmt::Debug for dyn RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteSession")
    }
}

/// `user@host:port` of a remote target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshTarget {
    pub host: String,
    pub username: String,
    pub port: u16,
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Opens sessions. The SSH connector is the production implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &SshTarget,
    ) -> Result<std::sync::Arc<dyn RemoteSession>, ConnectionError>;
}
