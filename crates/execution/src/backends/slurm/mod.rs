//! Slurm backend: batch scripts submitted over the remote session.
//!
//! Job layout on the cluster:
//!
//! ```text
//! <work_dir>/jobs/<job_id>/
//!     job.sh          rendered batch script
//!     logs/           scheduler stdout/stderr (slurm-<id>.out|err)
//!     inputs/         uploaded inputs, when not already on the cluster
//!     outputs/        container output mount
//! <work_dir>/images/  converted .sif archives, shared between jobs
//! ```

pub mod script;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neuroinsight_core::hpc::{map_scheduler_state, parse_sacct, parse_sbatch_job_id};
use neuroinsight_core::job_spec::ResolvedJobSpec;
use neuroinsight_core::status::{BackendType, ObservedState};
use neuroinsight_core::template::sh_quote;
use neuroinsight_core::types::JobId;
use neuroinsight_remote::ConnectionManager;
use tokio::sync::OnceCell;

use crate::backends::{
    parent_dir, prepare_output_dir, stage_inputs, BackendHandle, ExecutionBackend, JobLogs,
    LOG_TAIL_LINES,
};
use crate::error::ExecutionError;
use crate::host::{Host, RemoteHost};
use crate::settings::{ExecutionSettings, HpcSettings};

use self::script::{sanitize_image, BatchScript, ContainerRuntime};

const DETECT_RUNTIME_SCRIPT: &str = "for rt in apptainer singularity podman docker; do \
     command -v \"$rt\" >/dev/null 2>&1 && { echo \"$rt\"; exit 0; }; done; exit 1";

pub struct SlurmBackend {
    host: Arc<dyn Host>,
    hpc: HpcSettings,
    prefix: String,
    command_timeout: Duration,
    convert_timeout: Duration,
    runtime: OnceCell<ContainerRuntime>,
}

impl SlurmBackend {
    pub fn new(
        connections: Arc<ConnectionManager>,
        generation: u64,
        hpc: HpcSettings,
        settings: &ExecutionSettings,
    ) -> Self {
        Self::with_host(Arc::new(RemoteHost::new(connections, generation)), hpc, settings)
    }

    pub fn with_host(host: Arc<dyn Host>, hpc: HpcSettings, settings: &ExecutionSettings) -> Self {
        Self {
            host,
            hpc,
            prefix: settings.container_prefix.clone(),
            command_timeout: settings.command_timeout,
            convert_timeout: settings.pull_timeout,
            runtime: OnceCell::new(),
        }
    }

    fn work_dir<'a>(&'a self, spec: &'a ResolvedJobSpec) -> &'a str {
        spec.resources
            .work_dir
            .as_deref()
            .unwrap_or(&self.hpc.work_dir)
            .trim_end_matches('/')
    }

    async fn runtime(&self) -> Result<ContainerRuntime, ExecutionError> {
        self.runtime
            .get_or_try_init(|| async {
                let out = self
                    .host
                    .run_script(DETECT_RUNTIME_SCRIPT, self.command_timeout)
                    .await?;
                let found = out.stdout.lines().next().and_then(ContainerRuntime::from_program);
                match (out.success(), found) {
                    (true, Some(runtime)) => {
                        tracing::info!(runtime = runtime.program(), "Detected cluster container runtime");
                        Ok(runtime)
                    }
                    _ => Err(ExecutionError::Backend(
                        "no container runtime (apptainer, singularity, podman, docker) found on the cluster"
                            .to_string(),
                    )),
                }
            })
            .await
            .copied()
    }

    /// Make sure a usable `.sif` archive of `image` exists and return its path.
    ///
    /// Concurrent jobs serialize on a `flock` next to the archive; an archive
    /// that fails `inspect` is rebuilt.
    async fn ensure_archive(
        &self,
        runtime: ContainerRuntime,
        work_dir: &str,
        image: &str,
    ) -> Result<String, ExecutionError> {
        let images_dir = format!("{work_dir}/images");
        let sif = format!("{images_dir}/{}.sif", sanitize_image(image));
        let rt = runtime.program();
        let inner = format!(
            "{rt} inspect {sif} >/dev/null 2>&1 || {{ rm -f {sif}; {rt} build {sif} {source}; }}",
            sif = sh_quote(&sif),
            source = sh_quote(&format!("docker://{image}")),
        );
        let script = format!(
            "mkdir -p {dir} && flock {lock} sh -c {inner}",
            dir = sh_quote(&images_dir),
            lock = sh_quote(&format!("{sif}.lock")),
            inner = sh_quote(&inner),
        );
        let out = self.host.run_script(&script, self.convert_timeout).await?;
        if !out.success() {
            return Err(ExecutionError::command_failed(
                format!("{rt} build {sif}"),
                out.exit_code,
                &out.stderr,
            ));
        }
        Ok(sif)
    }

    fn scheduler_log(handle: &BackendHandle, ext: &str) -> String {
        format!(
            "{}/logs/slurm-{}.{ext}",
            parent_dir(&handle.output_dir),
            handle.backend_job_id
        )
    }

    async fn tail(&self, path: &str) -> Result<String, ExecutionError> {
        let lines = LOG_TAIL_LINES.to_string();
        let out = self
            .host
            .run("tail", &["-n".to_string(), lines, path.to_string()], self.command_timeout)
            .await?;
        Ok(if out.success() { out.stdout } else { String::new() })
    }
}

#[async_trait]
impl ExecutionBackend for SlurmBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Slurm
    }

    fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    fn output_dir(&self, job_id: JobId, spec: &ResolvedJobSpec) -> String {
        format!("{}/jobs/{job_id}/outputs", self.work_dir(spec))
    }

    async fn submit(
        &self,
        job_id: JobId,
        spec: &ResolvedJobSpec,
        output_dir: &str,
    ) -> Result<BackendHandle, ExecutionError> {
        let job_dir = parent_dir(output_dir);
        let log_dir = format!("{job_dir}/logs");
        prepare_output_dir(self.host.as_ref(), spec, output_dir, std::slice::from_ref(&log_dir)).await?;
        let staged = stage_inputs(self.host.as_ref(), spec, &format!("{job_dir}/inputs")).await?;

        let runtime = self.runtime().await?;
        let image = if runtime.needs_archive() {
            self.ensure_archive(runtime, self.work_dir(spec), &staged.container_image)
                .await?
        } else {
            staged.container_image.clone()
        };

        let partition = staged
            .resources
            .partition
            .clone()
            .unwrap_or_else(|| self.hpc.partition.clone());
        let body = BatchScript {
            job_id,
            spec: &staged,
            partition: &partition,
            log_dir: &log_dir,
            output_dir,
            runtime,
            image: &image,
            modules: &self.hpc.modules,
            container_prefix: &self.prefix,
        }
        .render();
        let script_path = format!("{job_dir}/job.sh");
        self.host.write_file(&script_path, body.as_bytes()).await?;

        let out = self
            .host
            .run("sbatch", std::slice::from_ref(&script_path), self.command_timeout)
            .await?;
        if !out.success() {
            return Err(ExecutionError::command_failed(
                format!("sbatch {script_path}"),
                out.exit_code,
                &out.stderr,
            ));
        }
        let scheduler_id = parse_sbatch_job_id(&out.stdout).ok_or_else(|| {
            ExecutionError::Backend(format!("unexpected sbatch output: {}", out.stdout.trim()))
        })?;
        tracing::info!(job_id = %job_id, scheduler_id = %scheduler_id, partition = %partition, "Batch job submitted");
        Ok(BackendHandle {
            backend_job_id: scheduler_id,
            output_dir: output_dir.to_string(),
        })
    }

    async fn query_status(&self, handle: &BackendHandle) -> Result<ObservedState, ExecutionError> {
        let id = &handle.backend_job_id;
        let queue = self
            .host
            .run(
                "squeue",
                &["-h".into(), "-j".into(), id.clone(), "-o".into(), "%T".into()],
                self.command_timeout,
            )
            .await?;
        if queue.success() {
            if let Some(state) = queue.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Ok(map_scheduler_state(state, None));
            }
        }

        // Gone from the queue: ask accounting for the final state.
        let acct = self
            .host
            .run(
                "sacct",
                &[
                    "-j".into(),
                    id.clone(),
                    "-n".into(),
                    "-X".into(),
                    "-P".into(),
                    "-o".into(),
                    "State,ExitCode".into(),
                ],
                self.command_timeout,
            )
            .await?;
        match parse_sacct(&acct.stdout) {
            Some((state, exit_code)) if acct.success() => Ok(map_scheduler_state(&state, exit_code)),
            _ => Ok(ObservedState::Unknown {
                raw: format!("job {id} not found in squeue or sacct"),
            }),
        }
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), ExecutionError> {
        let out = self
            .host
            .run("scancel", std::slice::from_ref(&handle.backend_job_id), self.command_timeout)
            .await?;
        if out.success() {
            tracing::info!(scheduler_id = %handle.backend_job_id, "scancel issued");
            Ok(())
        } else {
            Err(ExecutionError::command_failed(
                format!("scancel {}", handle.backend_job_id),
                out.exit_code,
                &out.stderr,
            ))
        }
    }

    async fn fetch_logs(&self, handle: &BackendHandle) -> Result<JobLogs, ExecutionError> {
        Ok(JobLogs {
            stdout: self.tail(&Self::scheduler_log(handle, "out")).await?,
            stderr: self.tail(&Self::scheduler_log(handle, "err")).await?,
        })
    }

    async fn finalize(&self, handle: &BackendHandle) -> Result<(), ExecutionError> {
        let logs = format!("{}/logs", handle.output_dir);
        let script = format!(
            "mkdir -p {logs} && cp -f {out} {logs}/stdout.log 2>/dev/null; cp -f {err} {logs}/stderr.log 2>/dev/null; true",
            logs = sh_quote(&logs),
            out = sh_quote(&Self::scheduler_log(handle, "out")),
            err = sh_quote(&Self::scheduler_log(handle, "err")),
        );
        self.host.run_script(&script, self.command_timeout).await?;
        Ok(())
    }

    fn reproduction_command(&self, _job_id: JobId, _spec: &ResolvedJobSpec, output_dir: &str) -> String {
        format!("sbatch {}/job.sh", parent_dir(output_dir))
    }
}
