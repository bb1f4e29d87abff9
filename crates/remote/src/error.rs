/// Failures of the remote session layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("No remote session is connected")]
    NotConnected,

    #[error("Remote session was lost: {0}")]
    ConnectionLost(String),

    /// The session a job was bound to has been replaced or closed.
    #[error("Session generation {generation} is no longer active")]
    SessionRetired { generation: u64 },

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Remote path not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl ConnectionError {
    /// Whether the failure says nothing about the remote work itself and the
    /// operation may be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::NotConnected
                | ConnectionError::ConnectionLost(_)
                | ConnectionError::Channel(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::Connect(_)
        )
    }
}
