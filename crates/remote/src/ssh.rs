//! `russh` transport: agent-only authentication, exec channels and SFTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use russh::client::{AuthResult, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::learn_known_hosts;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ConnectionError;
use crate::session::{CommandOutput, Connector, RemoteEntry, RemoteSession, SshTarget};

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Client handler that trusts a host key on first use and rejects changes.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    port: u16,
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::info!(host = %self.host, port = self.port, "Learning new server key");
                learn_known_hosts(&self.host, self.port, server_public_key).map_err(|e| {
                    anyhow!("failed to learn server key for {}:{}: {e}", self.host, self.port)
                })?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(host = %self.host, port = self.port, error = %e, "Server key validation failed");
                Err(anyhow!("server key validation failed for {}:{}: {e}", self.host, self.port))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Timeouts applied to the SSH transport.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

pub struct SshConnector {
    settings: SshSettings,
    config: Arc<Config>,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        let config = Config {
            keepalive_interval: Some(settings.keepalive_interval),
            keepalive_max: 3,
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            settings,
            config: Arc::new(config),
        }
    }

    async fn open(&self, target: &SshTarget) -> Result<SshSession, ConnectionError> {
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
        };
        let mut handle = russh::client::connect(
            Arc::clone(&self.config),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| ConnectionError::Connect(format!("{target}: {e}")))?;

        authenticate_with_agent(&mut handle, &target.username).await?;
        Ok(SshSession { handle })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn RemoteSession>, ConnectionError> {
        let secs = self.settings.connect_timeout.as_secs();
        let session = tokio::time::timeout(self.settings.connect_timeout, self.open(target))
            .await
            .map_err(|_| ConnectionError::Timeout(secs))??;
        Ok(Arc::new(session))
    }
}

/// Offer every identity held by the local agent until one is accepted.
///
/// Private keys never leave the agent; the agent signs the challenge.
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> Result<(), ConnectionError> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| ConnectionError::Auth(format!("SSH agent unavailable (is SSH_AUTH_SOCK set?): {e}")))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectionError::Auth(format!("SSH agent refused to list identities: {e}")))?;
    if identities.is_empty() {
        return Err(ConnectionError::Auth("SSH agent holds no identities".into()));
    }

    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
    for key in identities {
        match handle
            .authenticate_publickey_with(username, key, hash_alg, &mut agent)
            .await
        {
            Ok(AuthResult::Success) => return Ok(()),
            Ok(AuthResult::Failure { .. }) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Agent signing failed, trying next identity");
            }
        }
    }
    Err(ConnectionError::Auth(format!(
        "no agent identity accepted for user '{username}'"
    )))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct SshSession {
    handle: Handle<ClientHandler>,
}

impl SshSession {
    async fn sftp(&self) -> Result<SftpSession, ConnectionError> {
        let channel = self.open_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ConnectionError::Channel(e.to_string()))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ConnectionError::Sftp(e.to_string()))
    }

    async fn open_channel(&self) -> Result<russh::Channel<russh::client::Msg>, ConnectionError> {
        if self.handle.is_closed() {
            return Err(ConnectionError::ConnectionLost("transport closed".into()));
        }
        self.handle.channel_open_session().await.map_err(|e| match e {
            russh::Error::Disconnect | russh::Error::SendError => {
                ConnectionError::ConnectionLost(e.to_string())
            }
            other => ConnectionError::Channel(other.to_string()),
        })
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ConnectionError::Channel(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            if capture_message(&msg, &mut stdout, &mut stderr, &mut exit_code) {
                break;
            }
        }
        let _ = channel.close().await;

        // A channel that closes without an exit status died with the transport.
        let exit_code = exit_code
            .ok_or_else(|| ConnectionError::ConnectionLost("channel closed without exit status".into()))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

/// Fold one channel message into the capture buffers. Returns `true` when
/// the channel is finished.
fn capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut Option<i32>,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => out.extend_from_slice(data),
        ChannelMsg::ExtendedData { data, ext: 1 } => err.extend_from_slice(data),
        ChannelMsg::ExitStatus { exit_status } => {
            *code = Some(i32::try_from(*exit_status).unwrap_or(i32::MAX));
        }
        ChannelMsg::ExitSignal { .. } => {
            code.get_or_insert(255);
        }
        ChannelMsg::Close => return true,
        _ => {}
    }
    false
}

fn sftp_error(path: &str, err: russh_sftp::client::error::Error) -> ConnectionError {
    match &err {
        russh_sftp::client::error::Error::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => ConnectionError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => ConnectionError::PermissionDenied(path.to_string()),
            _ => ConnectionError::Sftp(format!("{path}: {err}")),
        },
        _ => ConnectionError::Sftp(format!("{path}: {err}")),
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ConnectionError> {
        tracing::debug!(command, "Executing remote command");
        tokio::time::timeout(timeout, self.run(command))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, ConnectionError> {
        let sftp = self.sftp().await?;
        let entries = sftp.read_dir(path).await.map_err(|e| sftp_error(path, e))?;
        Ok(entries
            .map(|entry| {
                let name = entry.file_name();
                let meta = entry.metadata();
                RemoteEntry {
                    path: join_remote(path, &name),
                    is_dir: meta.is_dir(),
                    size_bytes: meta.size.unwrap_or(0),
                    modified: meta.mtime.map(i64::from),
                    name,
                }
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ConnectionError> {
        let sftp = self.sftp().await?;
        let mut file = sftp.open(path).await.map_err(|e| sftp_error(path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| ConnectionError::Sftp(format!("{path}: {e}")))?;
        Ok(buf)
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ConnectionError> {
        let sftp = self.sftp().await?;
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let mut file = sftp
            .open_with_flags(path, flags)
            .await
            .map_err(|e| sftp_error(path, e))?;
        file.write_all(contents)
            .await
            .map_err(|e| ConnectionError::Sftp(format!("{path}: {e}")))?;
        file.flush()
            .await
            .map_err(|e| ConnectionError::Sftp(format!("{path}: {e}")))?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "client disconnect", "en")
            .await
        {
            tracing::debug!(error = %e, "SSH disconnect returned an error");
        }
    }
}
