//! The machine a backend drives: this one, or the far end of the session.
//!
//! Backends never talk to `tokio::process` or the SSH session directly. They
//! run programs and touch files through a [`Host`], which keeps one backend
//! implementation usable both locally and over SSH.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neuroinsight_core::hashing::sha256_file;
use neuroinsight_core::template::sh_quote;
use neuroinsight_remote::{CommandOutput, ConnectionError, ConnectionManager};

use crate::error::ExecutionError;
use crate::runner::CommandRunner;

/// Bound on filesystem probes (`mkdir`, `find`, `sha256sum`).
const FS_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Host: Send + Sync {
    /// Short label for logs.
    fn describe(&self) -> String;

    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError>;

    /// Run a `sh` script.
    async fn run_script(&self, script: &str, timeout: Duration) -> Result<CommandOutput, ExecutionError>;

    async fn create_dirs(&self, dirs: &[String]) -> Result<(), ExecutionError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecutionError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ExecutionError>;

    async fn exists(&self, path: &str) -> Result<bool, ExecutionError>;

    /// Every regular file below `root` as `(relative path, size)`.
    async fn list_files(&self, root: &str) -> Result<Vec<(String, u64)>, ExecutionError>;

    /// SHA-256 hex digest and size of `path`.
    async fn hash_file(&self, path: &str) -> Result<(String, u64), ExecutionError>;

    /// Whether files on this host are also files of this process.
    fn is_local(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

pub struct LocalHost {
    runner: Arc<dyn CommandRunner>,
}

impl LocalHost {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Host for LocalHost {
    fn describe(&self) -> String {
        "local".to_string()
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        self.runner.run(program, args, timeout).await
    }

    async fn run_script(&self, script: &str, timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        let args = vec!["-c".to_string(), script.to_string()];
        self.runner.run("sh", &args, timeout).await
    }

    async fn create_dirs(&self, dirs: &[String]) -> Result<(), ExecutionError> {
        for dir in dirs {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecutionError> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ExecutionError> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn exists(&self, path: &str) -> Result<bool, ExecutionError> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list_files(&self, root: &str) -> Result<Vec<(String, u64)>, ExecutionError> {
        let root = PathBuf::from(root);
        tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|e| ExecutionError::Backend(format!("output walk panicked: {e}")))?
    }

    async fn hash_file(&self, path: &str) -> Result<(String, u64), ExecutionError> {
        let path = PathBuf::from(path);
        let digest = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| ExecutionError::Backend(format!("hashing panicked: {e}")))??;
        Ok(digest)
    }

    fn is_local(&self) -> bool {
        true
    }
}

fn walk_files(root: &Path) -> Result<Vec<(String, u64)>, ExecutionError> {
    if !root.is_dir() {
        return Err(ExecutionError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        )));
    }
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Skipping unreadable output entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((rel, size));
    }
    Ok(files)
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// A host reached through one specific session generation.
///
/// Once the manager has moved to a newer session every call fails with
/// [`ConnectionError::SessionRetired`].
pub struct RemoteHost {
    connections: Arc<ConnectionManager>,
    generation: u64,
}

impl RemoteHost {
    pub fn new(connections: Arc<ConnectionManager>, generation: u64) -> Self {
        Self {
            connections,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        let session = self.connections.session_for(self.generation).await?;
        self.connections.touch();
        Ok(session.exec(command, timeout).await?)
    }

    async fn exec_checked(&self, command: &str) -> Result<CommandOutput, ExecutionError> {
        let out = self.exec(command, FS_TIMEOUT).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(ExecutionError::command_failed(command, out.exit_code, &out.stderr))
        }
    }
}

#[async_trait]
impl Host for RemoteHost {
    fn describe(&self) -> String {
        format!("remote (session {})", self.generation)
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        self.exec(&shell_join(program, args), timeout).await
    }

    async fn run_script(&self, script: &str, timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        self.exec(script, timeout).await
    }

    async fn create_dirs(&self, dirs: &[String]) -> Result<(), ExecutionError> {
        if dirs.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = std::iter::once("-p".to_string()).chain(dirs.iter().cloned()).collect();
        self.exec_checked(&shell_join("mkdir", &args)).await?;
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecutionError> {
        let session = self.connections.session_for(self.generation).await?;
        self.connections.touch();
        Ok(session.write_file(path, contents).await?)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ExecutionError> {
        let session = self.connections.session_for(self.generation).await?;
        self.connections.touch();
        Ok(session.read_file(path).await?)
    }

    async fn exists(&self, path: &str) -> Result<bool, ExecutionError> {
        let out = self.exec(&format!("test -e {}", sh_quote(path)), FS_TIMEOUT).await?;
        Ok(out.success())
    }

    async fn list_files(&self, root: &str) -> Result<Vec<(String, u64)>, ExecutionError> {
        let command = format!("find {} -type f -printf '%P\\t%s\\n'", sh_quote(root));
        let out = self.exec(&command, FS_TIMEOUT).await?;
        if !out.success() {
            return Err(ConnectionError::NotFound(format!("{root}: {}", out.stderr.trim())).into());
        }
        let mut files: Vec<(String, u64)> = out
            .stdout
            .lines()
            .filter_map(|line| {
                let (path, size) = line.rsplit_once('\t')?;
                Some((path.to_string(), size.trim().parse().unwrap_or(0)))
            })
            .filter(|(path, _)| !path.is_empty())
            .collect();
        files.sort();
        Ok(files)
    }

    async fn hash_file(&self, path: &str) -> Result<(String, u64), ExecutionError> {
        let quoted = sh_quote(path);
        let out = self
            .exec_checked(&format!("sha256sum {quoted} && stat -c %s {quoted}"))
            .await?;
        parse_hash_output(&out.stdout)
            .ok_or_else(|| ExecutionError::Backend(format!("unexpected sha256sum output for {path}")))
    }

    fn is_local(&self) -> bool {
        false
    }
}

/// `program` followed by its arguments, each quoted when the shell would
/// otherwise split or expand it.
pub fn shell_join(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| quote_arg(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        sh_quote(arg)
    }
}

/// `<hex>  <path>` followed by the size on its own line.
fn parse_hash_output(stdout: &str) -> Option<(String, u64)> {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
    let digest = lines.next()?.split_whitespace().next()?.to_ascii_lowercase();
    let size = lines.next()?.trim().parse().ok()?;
    neuroinsight_core::hashing::is_sha256_hex(&digest).then_some((digest, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessRunner;
    use assert_matches::assert_matches;
    use neuroinsight_remote::testing::{ScriptedConnector, ScriptedSession};
    use neuroinsight_remote::SshTarget;

    async fn remote(session: Arc<ScriptedSession>) -> (Arc<ConnectionManager>, RemoteHost) {
        let connector = Arc::new(ScriptedConnector::new(session));
        let manager = Arc::new(ConnectionManager::new(connector, Duration::from_secs(5)));
        let status = manager
            .connect(SshTarget {
                host: "hpc".into(),
                username: "alice".into(),
                port: 22,
            })
            .await
            .unwrap();
        let host = RemoteHost::new(manager.clone(), status.generation.unwrap());
        (manager, host)
    }

    #[test]
    fn shell_join_quotes_only_when_needed() {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            "neuroinsight_abc".to_string(),
        ];
        assert_eq!(
            shell_join("docker", &args),
            "docker inspect --format '{{.State.Status}} {{.State.ExitCode}}' neuroinsight_abc"
        );
    }

    #[test]
    fn hash_output_is_parsed() {
        let digest = "a".repeat(64);
        let out = format!("{digest}  /data/sub-01.nii.gz\n1048576\n");
        assert_eq!(parse_hash_output(&out), Some((digest, 1_048_576)));
        assert_eq!(parse_hash_output("garbage\n12\n"), None);
    }

    #[tokio::test]
    async fn local_host_lists_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("native/mri")).unwrap();
        std::fs::write(dir.path().join("native/mri/aseg.mgz"), b"12345").unwrap();
        std::fs::write(dir.path().join("job_spec.json"), b"{}").unwrap();

        let host = LocalHost::new(Arc::new(ProcessRunner));
        let files = host.list_files(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(
            files,
            vec![("job_spec.json".to_string(), 2), ("native/mri/aseg.mgz".to_string(), 5)]
        );
    }

    #[tokio::test]
    async fn local_host_missing_root_is_an_error() {
        let host = LocalHost::new(Arc::new(ProcessRunner));
        assert_matches!(host.list_files("/nonexistent/neuroinsight").await, Err(ExecutionError::Io(_)));
    }

    #[tokio::test]
    async fn remote_host_parses_find_output() {
        let session = Arc::new(ScriptedSession::new());
        session.on("find", CommandOutput::ok("stats/aseg.stats\t2048\nlogs/stdout.log\t10\n"));
        let (_manager, host) = remote(session).await;

        let files = host.list_files("/scratch/jobs/x/outputs").await.unwrap();
        assert_eq!(files[0], ("logs/stdout.log".to_string(), 10));
        assert_eq!(files[1], ("stats/aseg.stats".to_string(), 2048));
    }

    #[tokio::test]
    async fn remote_host_is_bound_to_its_generation() {
        let session = Arc::new(ScriptedSession::new());
        let (manager, host) = remote(session).await;
        manager
            .connect(SshTarget {
                host: "other".into(),
                username: "alice".into(),
                port: 22,
            })
            .await
            .unwrap();

        assert_matches!(
            host.run("true", &[], Duration::from_secs(1)).await,
            Err(e) if e.is_session_retired()
        );
    }
}
