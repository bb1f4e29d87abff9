//! The process-wide connection manager.
//!
//! Holds at most one live session. Every successful `connect` starts a new
//! generation; callers that bound work to generation N keep asking for
//! generation N through [`ConnectionManager::session_for`] and get
//! [`ConnectionError::SessionRetired`] once it has been replaced, instead of
//! being silently moved onto the new session.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use neuroinsight_core::hpc::{
    parse_associations, parse_sinfo, parse_squeue, AccountAssociation, Partition, QueueEntry, SACCTMGR_FORMAT,
    SINFO_FORMAT, SQUEUE_FORMAT,
};
use neuroinsight_core::template::sh_quote;
use neuroinsight_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};

use crate::error::ConnectionError;
use crate::info::{build_listing, parse_system_info, DirectoryListing, SystemInfo, SYSTEM_INFO_SCRIPT};
use crate::session::{CommandOutput, Connector, RemoteSession, SshTarget};

/// Bound on short probe commands (health check, listings).
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

struct Active {
    target: SshTarget,
    session: Arc<dyn RemoteSession>,
    generation: u64,
    connected_at: Timestamp,
    partitions: Vec<Partition>,
}

/// Snapshot reported by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub host: Option<String>,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub generation: Option<u64>,
    pub connected_at: Option<Timestamp>,
    pub idle_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub message: String,
    pub remote_hostname: Option<String>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    command_timeout: Duration,
    /// Serializes connect / disconnect.
    switch_lock: Mutex<()>,
    active: RwLock<Option<Active>>,
    next_generation: AtomicU64,
    last_activity: StdMutex<Instant>,
    generation_tx: watch::Sender<Option<u64>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, command_timeout: Duration) -> Self {
        let (generation_tx, _) = watch::channel(None);
        Self {
            connector,
            command_timeout,
            switch_lock: Mutex::new(()),
            active: RwLock::new(None),
            next_generation: AtomicU64::new(1),
            last_activity: StdMutex::new(Instant::now()),
            generation_tx,
        }
    }

    /// Notified with `Some(generation)` on every connect and `None` on
    /// disconnect.
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.generation_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Connect / disconnect
    // -----------------------------------------------------------------------

    /// Open a session to `target`, replacing any existing one.
    pub async fn connect(&self, target: SshTarget) -> Result<ConnectionStatus, ConnectionError> {
        let _guard = self.switch_lock.lock().await;

        if let Some(old) = self.active.write().await.take() {
            tracing::info!(target = %old.target, generation = old.generation, "Replacing existing session");
            old.session.close().await;
        }

        let session = match self.connector.connect(&target).await {
            Ok(session) => session,
            Err(e) => {
                self.generation_tx.send_replace(None);
                tracing::warn!(target = %target, error = %e, "SSH connect failed");
                return Err(e);
            }
        };
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(target = %target, generation, "SSH session established");

        *self.active.write().await = Some(Active {
            target,
            session,
            generation,
            connected_at: Utc::now(),
            partitions: Vec::new(),
        });
        self.touch();
        self.generation_tx.send_replace(Some(generation));
        Ok(self.status().await)
    }

    /// Close the active session. Returns `false` when none was open.
    pub async fn disconnect(&self) -> bool {
        let _guard = self.switch_lock.lock().await;
        let Some(old) = self.active.write().await.take() else {
            return false;
        };
        old.session.close().await;
        self.generation_tx.send_replace(None);
        tracing::info!(target = %old.target, generation = old.generation, "SSH session closed");
        true
    }

    /// Disconnect when nothing used the session for `idle_timeout`.
    pub async fn disconnect_if_idle(&self, idle_timeout: Duration) -> bool {
        if self.active.read().await.is_none() || self.idle_for() < idle_timeout {
            return false;
        }
        tracing::info!(idle_secs = self.idle_for().as_secs(), "Disconnecting idle SSH session");
        self.disconnect().await
    }

    pub async fn status(&self) -> ConnectionStatus {
        let guard = self.active.read().await;
        match guard.as_ref() {
            Some(active) => ConnectionStatus {
                connected: !active.session.is_closed(),
                host: Some(active.target.host.clone()),
                username: Some(active.target.username.clone()),
                port: Some(active.target.port),
                generation: Some(active.generation),
                connected_at: Some(active.connected_at),
                idle_secs: Some(self.idle_for().as_secs()),
            },
            None => ConnectionStatus {
                connected: false,
                host: None,
                username: None,
                port: None,
                generation: None,
                connected_at: None,
                idle_secs: None,
            },
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.active
            .read()
            .await
            .as_ref()
            .is_some_and(|a| !a.session.is_closed())
    }

    pub async fn target(&self) -> Option<SshTarget> {
        self.active.read().await.as_ref().map(|a| a.target.clone())
    }

    // -----------------------------------------------------------------------
    // Session access
    // -----------------------------------------------------------------------

    /// The active session and its generation.
    pub async fn current(&self) -> Result<(Arc<dyn RemoteSession>, u64), ConnectionError> {
        let guard = self.active.read().await;
        let active = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        if active.session.is_closed() {
            return Err(ConnectionError::ConnectionLost(format!(
                "session to {} dropped",
                active.target
            )));
        }
        Ok((Arc::clone(&active.session), active.generation))
    }

    /// Target and generation of the live session, read together so a
    /// concurrent reconnect cannot pair one session's target with another's
    /// generation.
    pub async fn binding(&self) -> Result<(SshTarget, u64), ConnectionError> {
        let guard = self.active.read().await;
        let active = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        if active.session.is_closed() {
            return Err(ConnectionError::ConnectionLost(format!(
                "session to {} dropped",
                active.target
            )));
        }
        Ok((active.target.clone(), active.generation))
    }

    /// The session of exactly `generation`.
    pub async fn session_for(&self, generation: u64) -> Result<Arc<dyn RemoteSession>, ConnectionError> {
        let guard = self.active.read().await;
        match guard.as_ref() {
            Some(active) if active.generation == generation => {
                if active.session.is_closed() {
                    Err(ConnectionError::ConnectionLost(format!(
                        "session to {} dropped",
                        active.target
                    )))
                } else {
                    Ok(Arc::clone(&active.session))
                }
            }
            _ => Err(ConnectionError::SessionRetired { generation }),
        }
    }

    /// Run a command on the active session with the configured timeout.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        let (session, _) = self.current().await?;
        self.touch();
        session.exec(command, self.command_timeout).await
    }

    /// Run a command on the session of `generation`.
    pub async fn exec_on(&self, generation: u64, command: &str) -> Result<CommandOutput, ConnectionError> {
        let session = self.session_for(generation).await?;
        self.touch();
        session.exec(command, self.command_timeout).await
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Record activity for the idle timer.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Remote queries
    // -----------------------------------------------------------------------

    /// `echo ok` round trip plus the remote hostname.
    pub async fn health_check(&self) -> HealthReport {
        let (session, _) = match self.current().await {
            Ok(current) => current,
            Err(e) => {
                return HealthReport {
                    healthy: false,
                    message: e.to_string(),
                    remote_hostname: None,
                }
            }
        };
        self.touch();
        match session.exec("echo ok && hostname", PROBE_TIMEOUT).await {
            Ok(out) if out.success() && out.stdout.starts_with("ok") => {
                let hostname = out.stdout.lines().nth(1).map(|h| h.trim().to_string());
                HealthReport {
                    healthy: true,
                    message: format!("Connected to {}", hostname.as_deref().unwrap_or("remote host")),
                    remote_hostname: hostname,
                }
            }
            Ok(out) => HealthReport {
                healthy: false,
                message: format!("Health probe exited with {}", out.exit_code),
                remote_hostname: None,
            },
            Err(e) => HealthReport {
                healthy: false,
                message: format!("Health probe failed: {e}"),
                remote_hostname: None,
            },
        }
    }

    /// Query `sinfo` and cache the result on the active session.
    pub async fn list_partitions(&self) -> Result<Vec<Partition>, ConnectionError> {
        let (session, generation) = self.current().await?;
        self.touch();
        let out = session
            .exec(&format!("sinfo --noheader -o '{SINFO_FORMAT}'"), PROBE_TIMEOUT)
            .await?;
        if !out.success() {
            return Err(ConnectionError::Channel(format!(
                "sinfo exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        let partitions = parse_sinfo(&out.stdout);
        if let Some(active) = self.active.write().await.as_mut() {
            if active.generation == generation {
                active.partitions = partitions.clone();
            }
        }
        Ok(partitions)
    }

    /// Partitions from the last `list_partitions` on this session.
    pub async fn cached_partitions(&self) -> Vec<Partition> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| a.partitions.clone())
            .unwrap_or_default()
    }

    /// The connected user's scheduler queue.
    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>, ConnectionError> {
        let (session, generation) = self.current().await?;
        let user = self.username_of(generation).await?;
        self.touch();
        let out = session
            .exec(
                &format!("squeue -h -u {} -o '{SQUEUE_FORMAT}'", sh_quote(&user)),
                PROBE_TIMEOUT,
            )
            .await?;
        if !out.success() {
            return Err(ConnectionError::Channel(format!(
                "squeue exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(parse_squeue(&out.stdout))
    }

    /// Accounts and QOS the connected user may submit under.
    pub async fn list_accounts(&self) -> Result<Vec<AccountAssociation>, ConnectionError> {
        let (session, generation) = self.current().await?;
        let user = self.username_of(generation).await?;
        self.touch();
        let out = session
            .exec(
                &format!(
                    "sacctmgr -nP show assoc user={} format={SACCTMGR_FORMAT}",
                    sh_quote(&user)
                ),
                PROBE_TIMEOUT,
            )
            .await?;
        if !out.success() {
            return Err(ConnectionError::Channel(format!(
                "sacctmgr exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(parse_associations(&out.stdout))
    }

    async fn username_of(&self, generation: u64) -> Result<String, ConnectionError> {
        match self.binding().await? {
            (target, current) if current == generation => Ok(target.username),
            _ => Err(ConnectionError::SessionRetired { generation }),
        }
    }

    pub async fn browse(&self, path: &str) -> Result<DirectoryListing, ConnectionError> {
        let (session, _) = self.current().await?;
        self.touch();
        let entries = session.read_dir(path).await?;
        Ok(build_listing(path, entries))
    }

    /// Copy a remote file to `local_path`. Returns the number of bytes.
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64, ConnectionError> {
        let (session, _) = self.current().await?;
        self.touch();
        let bytes = session.read_file(remote_path).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConnectionError::Sftp(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(local_path, &bytes)
            .await
            .map_err(|e| ConnectionError::Sftp(format!("{}: {e}", local_path.display())))?;
        Ok(bytes.len() as u64)
    }

    pub async fn system_info(&self) -> Result<SystemInfo, ConnectionError> {
        let (session, _) = self.current().await?;
        let target = self.target().await.ok_or(ConnectionError::NotConnected)?;
        self.touch();
        let out = session.exec(SYSTEM_INFO_SCRIPT, PROBE_TIMEOUT).await?;
        Ok(parse_system_info(&target.host, &target.username, &out.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedConnector, ScriptedSession};
    use assert_matches::assert_matches;

    fn target(host: &str) -> SshTarget {
        SshTarget {
            host: host.into(),
            username: "alice".into(),
            port: 22,
        }
    }

    fn manager(session: Arc<ScriptedSession>) -> (ConnectionManager, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new(session));
        let manager = ConnectionManager::new(connector.clone(), Duration::from_secs(5));
        (manager, connector)
    }

    #[tokio::test]
    async fn operations_require_a_session() {
        let (manager, _) = manager(Arc::new(ScriptedSession::new()));
        assert_matches!(manager.exec("true").await, Err(ConnectionError::NotConnected));
        assert_matches!(manager.browse("/").await, Err(ConnectionError::NotConnected));
        assert!(!manager.status().await.connected);
        assert!(!manager.health_check().await.healthy);
    }

    #[tokio::test]
    async fn reconnect_retires_previous_generation() {
        let (manager, connector) = manager(Arc::new(ScriptedSession::new()));
        let mut rx = manager.subscribe();

        let first = manager.connect(target("hpc-a")).await.unwrap();
        let gen1 = first.generation.unwrap();
        assert!(first.connected);
        assert_eq!(*rx.borrow_and_update(), Some(gen1));

        let second = manager.connect(target("hpc-b")).await.unwrap();
        let gen2 = second.generation.unwrap();
        assert!(gen2 > gen1);
        assert_eq!(second.host.as_deref(), Some("hpc-b"));
        assert_eq!(connector.connects(), 2);

        assert_matches!(
            manager.session_for(gen1).await,
            Err(ConnectionError::SessionRetired { generation }) if generation == gen1
        );
        assert!(manager.session_for(gen2).await.is_ok());

        let (bound, generation) = manager.binding().await.unwrap();
        assert_eq!(bound, target("hpc-b"));
        assert_eq!(generation, gen2);
    }

    #[tokio::test]
    async fn disconnect_clears_session() {
        let session = Arc::new(ScriptedSession::new());
        let (manager, _) = manager(session.clone());
        let status = manager.connect(target("hpc")).await.unwrap();

        assert!(manager.disconnect().await);
        assert!(!manager.disconnect().await);
        assert!(session.is_closed());
        assert_matches!(
            manager.session_for(status.generation.unwrap()).await,
            Err(ConnectionError::SessionRetired { .. })
        );
        assert_eq!(*manager.subscribe().borrow(), None);
    }

    #[tokio::test]
    async fn dropped_session_surfaces_as_connection_lost() {
        let session = Arc::new(ScriptedSession::new());
        let (manager, _) = manager(session.clone());
        manager.connect(target("hpc")).await.unwrap();

        session.drop_connection();
        assert_matches!(manager.exec("true").await, Err(ConnectionError::ConnectionLost(_)));
        assert!(!manager.status().await.connected);
    }

    #[tokio::test]
    async fn failed_connect_leaves_no_session() {
        let (manager, connector) = manager(Arc::new(ScriptedSession::new()));
        connector.fail_next(ConnectionError::Auth("agent has no identities".into()));

        assert_matches!(manager.connect(target("hpc")).await, Err(ConnectionError::Auth(_)));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn partitions_are_parsed_and_cached() {
        let session = Arc::new(ScriptedSession::new());
        session.on(
            "sinfo",
            CommandOutput::ok("general*|up|2-00:00:00|4|0/64/0/64|192000|(null)\ngpu|up|1-00:00:00|1|0/32/0/32|256000|gpu:a100:4\n"),
        );
        let (manager, _) = manager(session);
        manager.connect(target("hpc")).await.unwrap();

        let partitions = manager.list_partitions().await.unwrap();
        assert_eq!(partitions.len(), 2);
        assert!(partitions[0].is_default);
        assert!(partitions[1].has_gpu());
        assert_eq!(manager.cached_partitions().await.len(), 2);
    }

    #[tokio::test]
    async fn queue_is_scoped_to_connected_user() {
        let session = Arc::new(ScriptedSession::new());
        session.on("squeue", CommandOutput::ok("4821|fastsurfer|RUNNING|1:02:03|general|4:00:00|1|node12\n"));
        let (manager, _) = manager(session.clone());
        manager.connect(target("hpc")).await.unwrap();

        let queue = manager.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].state, "RUNNING");
        assert!(session.calls().iter().any(|c| c.contains("-u 'alice'")));
    }

    #[tokio::test]
    async fn usernames_are_quoted_in_scheduler_commands() {
        let session = Arc::new(ScriptedSession::new());
        session.on("squeue", CommandOutput::ok(""));
        session.on("sacctmgr", CommandOutput::ok("lab-smith||normal|normal\n"));
        let (manager, _) = manager(session.clone());
        let odd = SshTarget {
            host: "hpc".into(),
            username: "al;touch x".into(),
            port: 22,
        };
        manager.connect(odd).await.unwrap();

        assert!(manager.list_queue().await.unwrap().is_empty());
        let accounts = manager.list_accounts().await.unwrap();
        assert_eq!(accounts[0].account, "lab-smith");

        let calls = session.calls();
        assert!(calls.iter().any(|c| c.contains("squeue -h -u 'al;touch x' ")));
        assert!(calls.iter().any(|c| c.contains("user='al;touch x' format=")));
        assert!(!calls.iter().any(|c| c.contains("-u al;")));
    }

    #[tokio::test]
    async fn failed_sacctmgr_is_a_channel_error() {
        let session = Arc::new(ScriptedSession::new());
        session.on("sacctmgr", CommandOutput::failed(1, "sacctmgr: error: Problem talking to the database"));
        let (manager, _) = manager(session);
        manager.connect(target("hpc")).await.unwrap();

        assert_matches!(manager.list_accounts().await, Err(ConnectionError::Channel(m)) if m.contains("database"));
    }

    #[tokio::test]
    async fn health_check_reports_hostname() {
        let session = Arc::new(ScriptedSession::new());
        session.on("echo ok", CommandOutput::ok("ok\nlogin01\n"));
        let (manager, _) = manager(session);
        manager.connect(target("hpc")).await.unwrap();

        let report = manager.health_check().await;
        assert!(report.healthy);
        assert_eq!(report.remote_hostname.as_deref(), Some("login01"));
    }

    #[tokio::test]
    async fn download_writes_local_file() {
        let session = Arc::new(ScriptedSession::new());
        session.put_file("/scratch/out/aseg.stats", b"# Measure BrainSeg");
        let (manager, _) = manager(session);
        manager.connect(target("hpc")).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nested/aseg.stats");
        let n = manager.download("/scratch/out/aseg.stats", &local).await.unwrap();
        assert_eq!(n, 18);
        assert_eq!(std::fs::read(&local).unwrap(), b"# Measure BrainSeg");

        assert_matches!(
            manager.download("/scratch/missing", &local).await,
            Err(ConnectionError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn idle_session_is_disconnected() {
        let (manager, _) = manager(Arc::new(ScriptedSession::new()));
        manager.connect(target("hpc")).await.unwrap();

        assert!(!manager.disconnect_if_idle(Duration::from_secs(3600)).await);
        assert!(manager.disconnect_if_idle(Duration::ZERO).await);
        assert!(!manager.is_connected().await);
    }
}
