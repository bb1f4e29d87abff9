//! Execution backends.
//!
//! A job picks exactly one backend at submission and keeps it for life. The
//! backend instance is built for that job (and, for remote backends, bound
//! to the session generation current at submission), so switching the
//! global selector later never reroutes a running job.

pub mod docker;
pub mod slurm;

use std::path::Path;

use async_trait::async_trait;
use neuroinsight_core::job_spec::ResolvedJobSpec;
use neuroinsight_core::status::{BackendType, ObservedState};
use neuroinsight_core::types::JobId;
use serde::Serialize;

use crate::error::ExecutionError;
use crate::host::Host;

pub use docker::DockerBackend;
pub use slurm::SlurmBackend;

/// Sub-directories created in every job output directory.
pub const OUTPUT_LAYOUT: &[&str] = &["native", "bundle/volumes", "bundle/metrics", "bundle/qc", "logs"];

/// Name of the resolved spec written next to the outputs.
pub const JOB_SPEC_FILE: &str = "job_spec.json";

/// Lines kept by `fetch_logs` while a job is running.
pub const LOG_TAIL_LINES: usize = 1000;

/// What a backend needs to find a submitted job again, also after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    /// Container name or scheduler job id.
    pub backend_job_id: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobLogs {
    pub stdout: String,
    pub stderr: String,
}

impl JobLogs {
    /// Both streams, for phase-marker matching.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// The host the job's files live on.
    fn host(&self) -> &dyn Host;

    /// Output location of `job_id` on the executing host.
    fn output_dir(&self, job_id: JobId, spec: &ResolvedJobSpec) -> String;

    /// Start the job. Returns once the backend has accepted it.
    async fn submit(
        &self,
        job_id: JobId,
        spec: &ResolvedJobSpec,
        output_dir: &str,
    ) -> Result<BackendHandle, ExecutionError>;

    async fn query_status(&self, handle: &BackendHandle) -> Result<ObservedState, ExecutionError>;

    /// Ask the backend to stop the job.
    async fn cancel(&self, handle: &BackendHandle) -> Result<(), ExecutionError>;

    /// Recent output. Falls back to persisted logs once the job is gone.
    async fn fetch_logs(&self, handle: &BackendHandle) -> Result<JobLogs, ExecutionError>;

    /// Persist logs into `<output_dir>/logs` and release backend resources.
    async fn finalize(&self, handle: &BackendHandle) -> Result<(), ExecutionError>;

    /// Command a user can run to reproduce the job by hand.
    fn reproduction_command(&self, job_id: JobId, spec: &ResolvedJobSpec, output_dir: &str) -> String;
}

/// Create the output layout and write the resolved spec into it.
pub(crate) async fn prepare_output_dir(
    host: &dyn Host,
    spec: &ResolvedJobSpec,
    output_dir: &str,
    extra_dirs: &[String],
) -> Result<(), ExecutionError> {
    let mut dirs: Vec<String> = std::iter::once(output_dir.to_string())
        .chain(OUTPUT_LAYOUT.iter().map(|sub| format!("{output_dir}/{sub}")))
        .collect();
    dirs.extend(extra_dirs.iter().cloned());
    host.create_dirs(&dirs).await?;

    let body = serde_json::to_vec_pretty(spec)
        .map_err(|e| ExecutionError::Backend(format!("failed to serialize job spec: {e}")))?;
    host.write_file(&format!("{output_dir}/{JOB_SPEC_FILE}"), &body).await
}

/// Make every input visible on the executing host.
///
/// Inputs already present are used in place. On a remote host, a file that
/// only exists on this machine is uploaded to `upload_dir` and the returned
/// spec points at the copy.
pub(crate) async fn stage_inputs(
    host: &dyn Host,
    spec: &ResolvedJobSpec,
    upload_dir: &str,
) -> Result<ResolvedJobSpec, ExecutionError> {
    let mut staged = spec.clone();
    for input in staged.input_files.iter_mut() {
        if host.exists(input).await? {
            continue;
        }
        let local = Path::new(input.as_str());
        if host.is_local() || !tokio::fs::try_exists(local).await.unwrap_or(false) {
            return Err(ExecutionError::Core(
                neuroinsight_core::error::CoreError::Validation(format!(
                    "Input file '{input}' not found on {}",
                    host.describe()
                )),
            ));
        }
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input")
            .to_string();
        let target = format!("{upload_dir}/{name}");
        let bytes = tokio::fs::read(local).await?;
        host.create_dirs(std::slice::from_ref(&upload_dir.to_string())).await?;
        host.write_file(&target, &bytes).await?;
        tracing::info!(input = %input, target = %target, bytes = bytes.len(), "Uploaded input file");
        *input = target;
    }
    Ok(staged)
}

/// Parent directory of a `/`-separated path.
pub(crate) fn parent_dir(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use crate::runner::ProcessRunner;
    use crate::testing::sample_spec;
    use assert_matches::assert_matches;
    use neuroinsight_core::error::CoreError;
    use std::sync::Arc;

    #[tokio::test]
    async fn output_dir_gets_layout_and_spec() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("job").to_string_lossy().into_owned();
        let host = LocalHost::new(Arc::new(ProcessRunner));
        let spec = sample_spec("/data/sub-01_T1w.nii.gz");

        prepare_output_dir(&host, &spec, &out, &[]).await.unwrap();

        for sub in OUTPUT_LAYOUT {
            assert!(Path::new(&out).join(sub).is_dir(), "{sub} missing");
        }
        let written: ResolvedJobSpec =
            serde_json::from_slice(&std::fs::read(Path::new(&out).join(JOB_SPEC_FILE)).unwrap()).unwrap();
        assert_eq!(written, spec);
    }

    #[tokio::test]
    async fn missing_local_input_is_rejected() {
        let host = LocalHost::new(Arc::new(ProcessRunner));
        let spec = sample_spec("/nonexistent/sub-01_T1w.nii.gz");
        assert_matches!(
            stage_inputs(&host, &spec, "/tmp/unused").await,
            Err(ExecutionError::Core(CoreError::Validation(_)))
        );
    }

    #[test]
    fn parent_dir_of_paths() {
        assert_eq!(parent_dir("/scratch/jobs/x/outputs"), "/scratch/jobs/x");
        assert_eq!(parent_dir("/outputs/"), "/");
        assert_eq!(parent_dir("outputs"), ".");
    }
}
