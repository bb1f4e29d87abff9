//! Container backend for the local engine and for a remote docker host.
//!
//! Both variants issue the same `docker` commands; only the [`Host`] that
//! runs them differs. The container name doubles as the backend job id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neuroinsight_core::container::{reproduction_command, DockerRun};
use neuroinsight_core::job_spec::ResolvedJobSpec;
use neuroinsight_core::status::{BackendType, ObservedState};
use neuroinsight_core::types::JobId;
use neuroinsight_remote::{CommandOutput, ConnectionManager};

use crate::backends::{
    parent_dir, prepare_output_dir, stage_inputs, BackendHandle, ExecutionBackend, JobLogs,
    LOG_TAIL_LINES,
};
use crate::error::ExecutionError;
use crate::host::{Host, LocalHost, RemoteHost};
use crate::runner::{display_command, CommandRunner};
use crate::settings::ExecutionSettings;

/// `docker inspect` template: `<status> <exit code>`.
const INSPECT_FORMAT: &str = "{{.State.Status}} {{.State.ExitCode}}";

/// Grace period handed to `docker stop` before SIGKILL.
const STOP_GRACE_SECS: u32 = 10;

pub struct DockerBackend {
    host: Arc<dyn Host>,
    backend_type: BackendType,
    prefix: String,
    /// Parent of every job output directory on the host.
    outputs_root: String,
    command_timeout: Duration,
    pull_timeout: Duration,
}

impl DockerBackend {
    /// The container engine on this machine.
    pub fn local(runner: Arc<dyn CommandRunner>, settings: &ExecutionSettings) -> Self {
        Self {
            host: Arc::new(LocalHost::new(runner)),
            backend_type: BackendType::Local,
            prefix: settings.container_prefix.clone(),
            outputs_root: settings.outputs_root().to_string_lossy().into_owned(),
            command_timeout: settings.command_timeout,
            pull_timeout: settings.pull_timeout,
        }
    }

    /// The container engine behind session `generation`, with job
    /// directories under `<work_dir>/jobs`.
    pub fn remote(
        connections: Arc<ConnectionManager>,
        generation: u64,
        work_dir: &str,
        settings: &ExecutionSettings,
    ) -> Self {
        Self {
            host: Arc::new(RemoteHost::new(connections, generation)),
            backend_type: BackendType::RemoteDocker,
            prefix: settings.container_prefix.clone(),
            outputs_root: format!("{}/jobs", work_dir.trim_end_matches('/')),
            command_timeout: settings.command_timeout,
            pull_timeout: settings.pull_timeout,
        }
    }

    async fn docker(&self, args: &[String], timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        self.host.run("docker", args, timeout).await
    }

    async fn docker_checked(&self, args: &[String], timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        let out = self.docker(args, timeout).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(ExecutionError::command_failed(
                display_command("docker", args),
                out.exit_code,
                &out.stderr,
            ))
        }
    }

    /// Pull `image` unless the engine already has it.
    async fn ensure_image(&self, image: &str) -> Result<(), ExecutionError> {
        let inspect = self
            .docker(&strings(&["image", "inspect", image]), self.command_timeout)
            .await?;
        if inspect.success() {
            return Ok(());
        }
        tracing::info!(image, host = %self.host.describe(), "Pulling container image");
        self.docker_checked(&strings(&["pull", image]), self.pull_timeout)
            .await?;
        Ok(())
    }

    fn uses_job_dir(&self) -> bool {
        self.backend_type.is_remote()
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    fn output_dir(&self, job_id: JobId, _spec: &ResolvedJobSpec) -> String {
        if self.uses_job_dir() {
            format!("{}/{job_id}/outputs", self.outputs_root)
        } else {
            format!("{}/{job_id}", self.outputs_root)
        }
    }

    async fn submit(
        &self,
        job_id: JobId,
        spec: &ResolvedJobSpec,
        output_dir: &str,
    ) -> Result<BackendHandle, ExecutionError> {
        prepare_output_dir(self.host.as_ref(), spec, output_dir, &[]).await?;
        let upload_dir = format!("{}/inputs", parent_dir(output_dir));
        let staged = stage_inputs(self.host.as_ref(), spec, &upload_dir).await?;

        self.ensure_image(&staged.container_image).await?;

        let run = DockerRun::for_job(&self.prefix, job_id, &staged, output_dir);
        // A container left behind by an interrupted earlier attempt would
        // make the name collide.
        match self
            .docker(&strings(&["rm", "-f", &run.name]), self.command_timeout)
            .await
        {
            Ok(out) if out.success() || out.stderr.contains("No such container") => {}
            Ok(out) => tracing::warn!(
                container = %run.name,
                exit_code = out.exit_code,
                stderr = %out.stderr.trim(),
                "Could not remove leftover container"
            ),
            Err(e) => tracing::warn!(container = %run.name, error = %e, "Could not remove leftover container"),
        }
        let out = self.docker_checked(&run.args(), self.command_timeout).await?;

        tracing::info!(
            job_id = %job_id,
            container = %run.name,
            container_id = out.stdout.trim(),
            host = %self.host.describe(),
            "Container started"
        );
        Ok(BackendHandle {
            backend_job_id: run.name,
            output_dir: output_dir.to_string(),
        })
    }

    async fn query_status(&self, handle: &BackendHandle) -> Result<ObservedState, ExecutionError> {
        let args = strings(&["inspect", "--format", INSPECT_FORMAT, &handle.backend_job_id]);
        let out = self.docker(&args, self.command_timeout).await?;
        if out.success() {
            return Ok(parse_inspect(&out.stdout));
        }
        if is_missing_container(&out.stderr) {
            return Ok(ObservedState::Unknown {
                raw: "container not found".to_string(),
            });
        }
        Err(ExecutionError::command_failed(
            display_command("docker", &args),
            out.exit_code,
            &out.stderr,
        ))
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), ExecutionError> {
        let grace = STOP_GRACE_SECS.to_string();
        let args = strings(&["stop", "-t", &grace, &handle.backend_job_id]);
        let out = self.docker(&args, self.command_timeout).await?;
        if out.success() || is_missing_container(&out.stderr) {
            tracing::info!(container = %handle.backend_job_id, "Container stopped");
            return Ok(());
        }
        Err(ExecutionError::command_failed(
            display_command("docker", &args),
            out.exit_code,
            &out.stderr,
        ))
    }

    async fn fetch_logs(&self, handle: &BackendHandle) -> Result<JobLogs, ExecutionError> {
        let tail = LOG_TAIL_LINES.to_string();
        let args = strings(&["logs", "--tail", &tail, &handle.backend_job_id]);
        let out = self.docker(&args, self.command_timeout).await?;
        if out.success() {
            return Ok(JobLogs {
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        if is_missing_container(&out.stderr) {
            return read_persisted_logs(self.host.as_ref(), &handle.output_dir).await;
        }
        Err(ExecutionError::command_failed(
            display_command("docker", &args),
            out.exit_code,
            &out.stderr,
        ))
    }

    async fn finalize(&self, handle: &BackendHandle) -> Result<(), ExecutionError> {
        let name = &handle.backend_job_id;
        let logs = self
            .docker(&strings(&["logs", name]), self.command_timeout)
            .await?;
        if logs.success() {
            let dir = &handle.output_dir;
            self.host
                .write_file(&format!("{dir}/logs/stdout.log"), logs.stdout.as_bytes())
                .await?;
            self.host
                .write_file(&format!("{dir}/logs/stderr.log"), logs.stderr.as_bytes())
                .await?;
        } else {
            tracing::warn!(container = %name, exit_code = logs.exit_code, "Could not capture container logs");
        }
        self.docker(&strings(&["rm", "-f", name]), self.command_timeout)
            .await?;
        tracing::debug!(container = %name, "Container removed");
        Ok(())
    }

    fn reproduction_command(&self, job_id: JobId, spec: &ResolvedJobSpec, output_dir: &str) -> String {
        reproduction_command(&DockerRun::for_job(&self.prefix, job_id, spec, output_dir))
    }
}

/// Map `docker inspect` output onto an observation.
pub fn parse_inspect(stdout: &str) -> ObservedState {
    let line = stdout.trim();
    let mut parts = line.split_whitespace();
    let status = parts.next().unwrap_or("");
    let exit_code: Option<i32> = parts.next().and_then(|c| c.parse().ok());
    match status {
        "created" => ObservedState::Pending,
        "running" | "paused" | "restarting" | "removing" => ObservedState::Running,
        "exited" => ObservedState::Exited {
            exit_code: exit_code.unwrap_or(1),
        },
        "dead" => ObservedState::Exited {
            exit_code: exit_code.filter(|c| *c != 0).unwrap_or(1),
        },
        _ => ObservedState::Unknown {
            raw: line.to_string(),
        },
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Logs written by `finalize`, or empty streams when none exist yet.
async fn read_persisted_logs(host: &dyn Host, output_dir: &str) -> Result<JobLogs, ExecutionError> {
    let read = |name: &'static str| async move {
        host.read_file(&format!("{output_dir}/logs/{name}"))
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    };
    Ok(JobLogs {
        stdout: read("stdout.log").await,
        stderr: read("stderr.log").await,
    })
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_spec, ScriptedRunner};
    use assert_matches::assert_matches;
    use neuroinsight_remote::testing::{ScriptedConnector, ScriptedSession};
    use neuroinsight_remote::{ConnectionError, SshTarget};
    use uuid::Uuid;

    fn local_backend(runner: Arc<ScriptedRunner>, data_dir: &std::path::Path) -> DockerBackend {
        let settings = ExecutionSettings {
            data_dir: data_dir.to_path_buf(),
            ..ExecutionSettings::default()
        };
        DockerBackend::local(runner, &settings)
    }

    fn input_file(dir: &std::path::Path) -> String {
        let path = dir.join("sub-01_T1w.nii.gz");
        std::fs::write(&path, b"nifti").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn inspect_states_map_to_observations() {
        assert_eq!(parse_inspect("created 0\n"), ObservedState::Pending);
        assert_eq!(parse_inspect("running 0"), ObservedState::Running);
        assert_eq!(parse_inspect("paused 0"), ObservedState::Running);
        assert_eq!(parse_inspect("exited 0"), ObservedState::Exited { exit_code: 0 });
        assert_eq!(parse_inspect("exited 137"), ObservedState::Exited { exit_code: 137 });
        assert_eq!(parse_inspect("dead 0"), ObservedState::Exited { exit_code: 1 });
        assert_matches!(parse_inspect("weird"), ObservedState::Unknown { .. });
    }

    #[tokio::test]
    async fn local_submit_pulls_missing_image_and_runs_detached() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker image inspect", CommandOutput::failed(1, "No such image"));
        runner.on("docker run", CommandOutput::ok("f00dcafe\n"));
        let backend = local_backend(runner.clone(), dir.path());

        let job_id = Uuid::new_v4();
        let spec = sample_spec(&input_file(dir.path()));
        let output_dir = backend.output_dir(job_id, &spec);
        let handle = backend.submit(job_id, &spec, &output_dir).await.unwrap();

        assert!(handle.backend_job_id.starts_with("neuroinsight_"));
        assert!(std::path::Path::new(&output_dir).join("job_spec.json").is_file());
        let calls = runner.calls();
        let pull = calls.iter().position(|c| c.starts_with("docker pull")).unwrap();
        let run = calls.iter().position(|c| c.starts_with("docker run -d")).unwrap();
        assert!(pull < run);
        assert!(calls[run].contains(":/data/outputs:rw"));
    }

    #[tokio::test]
    async fn present_image_is_not_pulled() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = local_backend(runner.clone(), dir.path());
        let job_id = Uuid::new_v4();
        let spec = sample_spec(&input_file(dir.path()));

        backend
            .submit(job_id, &spec, &backend.output_dir(job_id, &spec))
            .await
            .unwrap();
        assert!(!runner.calls().iter().any(|c| c.starts_with("docker pull")));
    }

    #[tokio::test]
    async fn failed_run_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker run", CommandOutput::failed(125, "docker: invalid reference format"));
        let backend = local_backend(runner, dir.path());
        let job_id = Uuid::new_v4();
        let spec = sample_spec(&input_file(dir.path()));

        let err = backend
            .submit(job_id, &spec, &backend.output_dir(job_id, &spec))
            .await
            .unwrap_err();
        assert_matches!(err, ExecutionError::CommandFailed { exit_code: 125, ref stderr, .. } if stderr.contains("invalid reference"));
    }

    #[tokio::test]
    async fn finalize_persists_logs_and_removes_container() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "docker logs",
            CommandOutput {
                stdout: "recon-all finished\n".into(),
                stderr: "warning: x\n".into(),
                exit_code: 0,
            },
        );
        let backend = local_backend(runner.clone(), dir.path());
        let output_dir = dir.path().join("out").to_string_lossy().into_owned();
        let handle = BackendHandle {
            backend_job_id: "neuroinsight_abc".into(),
            output_dir: output_dir.clone(),
        };

        backend.finalize(&handle).await.unwrap();

        let stdout = std::fs::read_to_string(format!("{output_dir}/logs/stdout.log")).unwrap();
        assert_eq!(stdout, "recon-all finished\n");
        assert!(runner.calls().iter().any(|c| c == "docker rm -f neuroinsight_abc"));
    }

    #[tokio::test]
    async fn logs_fall_back_to_persisted_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker logs", CommandOutput::failed(1, "Error: No such container: x"));
        let backend = local_backend(runner, dir.path());
        let output_dir = dir.path().to_string_lossy().into_owned();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/stdout.log"), "done\n").unwrap();

        let logs = backend
            .fetch_logs(&BackendHandle {
                backend_job_id: "x".into(),
                output_dir,
            })
            .await
            .unwrap();
        assert_eq!(logs.stdout, "done\n");
        assert_eq!(logs.stderr, "");
    }

    #[tokio::test]
    async fn stopping_a_vanished_container_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker stop", CommandOutput::failed(1, "Error response from daemon: No such container: x"));
        let backend = local_backend(runner, dir.path());
        let handle = BackendHandle {
            backend_job_id: "x".into(),
            output_dir: "/tmp".into(),
        };
        assert!(backend.cancel(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn remote_submit_runs_over_the_session() {
        let session = Arc::new(ScriptedSession::new());
        session.on("test -e", CommandOutput::ok(""));
        session.on("docker run", CommandOutput::ok("abc123\n"));
        session.on("docker inspect", CommandOutput::ok("running 0\n"));
        let connector = Arc::new(ScriptedConnector::new(session.clone()));
        let manager = Arc::new(ConnectionManager::new(connector, Duration::from_secs(5)));
        let generation = manager
            .connect(SshTarget {
                host: "gpu01".into(),
                username: "alice".into(),
                port: 22,
            })
            .await
            .unwrap()
            .generation
            .unwrap();
        let backend = DockerBackend::remote(manager, generation, "/scratch/alice/", &ExecutionSettings::default());

        let job_id = Uuid::new_v4();
        let spec = sample_spec("/scratch/alice/sub-01_T1w.nii.gz");
        let output_dir = backend.output_dir(job_id, &spec);
        assert_eq!(output_dir, format!("/scratch/alice/jobs/{job_id}/outputs"));

        let handle = backend.submit(job_id, &spec, &output_dir).await.unwrap();
        assert_eq!(backend.query_status(&handle).await.unwrap(), ObservedState::Running);

        let calls = session.calls();
        assert!(calls.iter().any(|c| c.starts_with("mkdir -p") && c.contains("bundle/qc")));
        assert!(calls.iter().any(|c| c.contains("/scratch/alice/sub-01_T1w.nii.gz:/data/inputs/sub-01_T1w.nii.gz:ro")));
        assert!(session.file(&format!("{output_dir}/job_spec.json")).is_some());
    }

    #[tokio::test]
    async fn failed_leftover_cleanup_does_not_block_submission() {
        let session = Arc::new(ScriptedSession::new());
        session.on("test -e", CommandOutput::ok(""));
        session.once_error("docker rm -f", ConnectionError::Timeout(30));
        session.on("docker run", CommandOutput::ok("abc123\n"));
        let connector = Arc::new(ScriptedConnector::new(session.clone()));
        let manager = Arc::new(ConnectionManager::new(connector, Duration::from_secs(5)));
        let generation = manager
            .connect(SshTarget {
                host: "gpu01".into(),
                username: "alice".into(),
                port: 22,
            })
            .await
            .unwrap()
            .generation
            .unwrap();
        let backend = DockerBackend::remote(manager, generation, "/scratch/alice/", &ExecutionSettings::default());

        let job_id = Uuid::new_v4();
        let spec = sample_spec("/scratch/alice/sub-01_T1w.nii.gz");
        let handle = backend
            .submit(job_id, &spec, &backend.output_dir(job_id, &spec))
            .await
            .unwrap();

        let calls = session.calls();
        let rm = calls.iter().position(|c| c.contains("docker rm -f")).unwrap();
        let run = calls.iter().position(|c| c.contains("docker run -d")).unwrap();
        assert!(rm < run);
        assert!(calls[run].contains(&handle.backend_job_id));
    }
}
