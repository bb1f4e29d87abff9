//! Job lifecycle manager: the single writer of job records.
//!
//! Submissions are validated and resolved before anything is persisted.
//! Each accepted job gets its own backend instance and supervision task;
//! the global backend selector only decides where *new* jobs go.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use neuroinsight_core::error::CoreError;
use neuroinsight_core::job_spec::{ExecutionUnit, ResolvedJobSpec};
use neuroinsight_core::phases::ProgressEstimator;
use neuroinsight_core::provenance::ProvenanceRecord;
use neuroinsight_core::registry::RegistryHandle;
use neuroinsight_core::resolve::{phase_table, resolve_job, JobRequest};
use neuroinsight_core::resources::{HostLimits, ResourceOverrides};
use neuroinsight_core::status::{BackendType, JobStatus};
use neuroinsight_core::types::JobId;
use neuroinsight_db::models::job::{Job, JobListQuery, JobProgress, NewJob};
use neuroinsight_db::models::output::JobOutput;
use neuroinsight_db::repositories::{JobRepo, OutputRepo, ProvenanceRepo};
use neuroinsight_db::DbPool;
use neuroinsight_remote::{ConnectionError, ConnectionManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog};
use crate::backends::{BackendHandle, DockerBackend, ExecutionBackend, JobLogs, SlurmBackend};
use crate::error::ExecutionError;
use crate::runner::CommandRunner;
use crate::settings::{BackendSelection, ExecutionSettings, HpcSettings};
use crate::supervisor::{cancel_job, SupervisorContext, USER_CANCEL_REASON};

fn default_pattern() -> String {
    "*.nii.gz".to_string()
}

/// One plugin or workflow run once per matching file in a directory.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub unit: ExecutionUnit,
    pub directory: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: ResourceOverrides,
    /// Overrides the active backend for this batch.
    #[serde(default)]
    pub backend_type: Option<BackendType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemError {
    pub input: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSubmission {
    pub batch_id: JobId,
    pub jobs: Vec<Job>,
    pub errors: Vec<BatchItemError>,
}

pub struct JobManager {
    ctx: Arc<SupervisorContext>,
    registry: Arc<RegistryHandle>,
    connections: Arc<ConnectionManager>,
    runner: Arc<dyn CommandRunner>,
    /// Write-locked for the whole of a switch, so switches never interleave.
    selection: RwLock<BackendSelection>,
}

impl JobManager {
    pub fn new(
        pool: DbPool,
        registry: Arc<RegistryHandle>,
        connections: Arc<ConnectionManager>,
        runner: Arc<dyn CommandRunner>,
        audit: Arc<AuditLog>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(SupervisorContext::new(pool, audit, settings)),
            registry,
            connections,
            runner,
            selection: RwLock::new(BackendSelection::default()),
        }
    }

    /// Start with `selection` active instead of local. No connection is
    /// required; remote submissions fail fast until one is made.
    pub fn with_selection(self, selection: BackendSelection) -> Self {
        Self {
            selection: RwLock::new(selection),
            ..self
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.ctx.pool
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.ctx.audit
    }

    pub fn registry(&self) -> &Arc<RegistryHandle> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.ctx.settings
    }

    /// Number of jobs with a live supervision task.
    pub fn supervised_jobs(&self) -> usize {
        self.ctx.supervised_count()
    }

    // -----------------------------------------------------------------------
    // Startup and shutdown
    // -----------------------------------------------------------------------

    /// Re-attach local jobs and start following session changes so remote
    /// jobs are re-attached on every new connection.
    pub async fn start(self: &Arc<Self>) -> Result<(), ExecutionError> {
        self.reattach_local().await?;
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.follow_sessions().await });
        Ok(())
    }

    /// Stop every supervision task. Jobs keep running on their backends and
    /// are re-attached on the next start.
    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
    }

    async fn reattach_local(&self) -> Result<usize, ExecutionError> {
        let mut count = 0;
        for job in JobRepo::list_unfinished(self.pool()).await? {
            if job.backend_type().is_remote() || self.ctx.lookup(job.id).is_some() {
                continue;
            }
            let backend = self.build_backend(BackendType::Local, None, &HpcSettings::default())?;
            self.ctx.spawn(&job, backend, None, self.estimator_for(&job.spec.0));
            count += 1;
        }
        if count > 0 {
            tracing::info!(jobs = count, "Re-attached local jobs");
        }
        Ok(count)
    }

    async fn follow_sessions(self: Arc<Self>) {
        let mut generations = self.connections.subscribe();
        let initial = *generations.borrow_and_update();
        if let Some(generation) = initial {
            self.reattach_logged(generation).await;
        }
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                changed = generations.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *generations.borrow_and_update();
                    if let Some(generation) = current {
                        self.reattach_logged(generation).await;
                    }
                }
            }
        }
    }

    async fn reattach_logged(&self, generation: u64) {
        if let Err(e) = self.reattach_remote(generation).await {
            tracing::error!(generation, error = %e, "Re-attaching remote jobs failed");
        }
    }

    /// Bind every unfinished remote job submitted through the same target
    /// to `generation`. Jobs from another target stay unbound and are
    /// flagged stale until a session to their own target is opened.
    pub async fn reattach_remote(&self, generation: u64) -> Result<usize, ExecutionError> {
        let (target, current) = match self.connections.binding().await {
            Ok(binding) => binding,
            Err(e) => {
                tracing::debug!(generation, error = %e, "Session gone before re-attach");
                return Ok(0);
            }
        };
        if current != generation {
            // A newer session replaced it; its own notification re-attaches.
            return Ok(0);
        }
        let target = target.to_string();
        let hpc = self.selection.read().await.hpc.clone();
        let mut count = 0;
        for job in JobRepo::list_unfinished(self.pool()).await? {
            if !job.backend_type().is_remote() {
                continue;
            }
            if self
                .ctx
                .lookup(job.id)
                .is_some_and(|s| s.generation == Some(generation))
            {
                continue;
            }
            if let Some(submitted) = job.session_target.as_deref().filter(|t| *t != target) {
                self.leave_unbound(&job, submitted, &target).await?;
                continue;
            }
            let backend = self.build_backend(job.backend_type(), Some(generation), &hpc)?;
            JobRepo::set_session_generation(self.pool(), job.id, to_db_generation(generation)).await?;
            self.ctx.spawn(&job, backend, Some(generation), self.estimator_for(&job.spec.0));
            tracing::info!(
                job_id = %job.id,
                generation,
                backend_job_id = ?job.backend_job_id,
                "Remote job re-attached"
            );
            self.audit()
                .record(
                    AuditEvent::JobReattached,
                    Some(job.id),
                    json!({ "generation": generation, "backend_job_id": job.backend_job_id }),
                )
                .await;
            count += 1;
        }
        Ok(count)
    }

    async fn leave_unbound(&self, job: &Job, submitted: &str, connected: &str) -> Result<(), ExecutionError> {
        tracing::warn!(
            job_id = %job.id,
            submitted_via = %submitted,
            connected_to = %connected,
            "Remote job belongs to another target; not re-attached"
        );
        JobRepo::mark_stale(self.pool(), job.id).await?;
        JobRepo::add_warning(
            self.pool(),
            job.id,
            &format!("Not re-attached: submitted via {submitted}; reconnect to it to resume monitoring"),
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate and resolve `request`, then submit it. Nothing is persisted
    /// when validation or the connection check fails.
    pub async fn submit_request(
        &self,
        request: JobRequest,
        backend_type: Option<BackendType>,
    ) -> Result<Job, ExecutionError> {
        let selection = self.selection.read().await.clone();
        let backend_type = backend_type.unwrap_or(selection.backend_type);
        let (limits, request) = self.prepare_request(request, backend_type, &selection.hpc).await?;
        let spec = resolve_job(&self.registry.snapshot(), &request, &limits)?;
        self.submit_with(spec, backend_type, &selection.hpc, None).await
    }

    /// Submit an already resolved spec.
    pub async fn submit(
        &self,
        spec: ResolvedJobSpec,
        backend_type: BackendType,
    ) -> Result<Job, ExecutionError> {
        let hpc = self.selection.read().await.hpc.clone();
        self.submit_with(spec, backend_type, &hpc, None).await
    }

    /// One independent job per file in `directory` matching `pattern`.
    /// A file that fails validation or submission is reported and skipped.
    pub async fn submit_batch(&self, request: BatchRequest) -> Result<BatchSubmission, ExecutionError> {
        let selection = self.selection.read().await.clone();
        let backend_type = request.backend_type.unwrap_or(selection.backend_type);
        let inputs = self
            .matching_inputs(backend_type, &request.directory, &request.pattern)
            .await?;
        if inputs.is_empty() {
            return Err(CoreError::Validation(format!(
                "No files matching '{}' in {}",
                request.pattern, request.directory
            ))
            .into());
        }

        let template = JobRequest {
            unit: request.unit,
            input_files: Vec::new(),
            parameters: request.parameters,
            resources: request.resources,
        };
        let (limits, template) = self.prepare_request(template, backend_type, &selection.hpc).await?;
        let registry = self.registry.snapshot();
        let batch_id = Uuid::new_v4();

        let mut jobs = Vec::with_capacity(inputs.len());
        let mut errors = Vec::new();
        for input in inputs {
            let request = JobRequest {
                input_files: vec![input.clone()],
                ..template.clone()
            };
            let submitted = match resolve_job(&registry, &request, &limits) {
                Ok(spec) => self.submit_with(spec, backend_type, &selection.hpc, Some(batch_id)).await,
                Err(e) => Err(e.into()),
            };
            match submitted {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(batch_id = %batch_id, input = %input, error = %e, "Batch item rejected");
                    errors.push(BatchItemError {
                        input,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(batch_id = %batch_id, jobs = jobs.len(), rejected = errors.len(), "Batch submitted");
        Ok(BatchSubmission {
            batch_id,
            jobs,
            errors,
        })
    }

    async fn submit_with(
        &self,
        spec: ResolvedJobSpec,
        backend_type: BackendType,
        hpc: &HpcSettings,
        batch_id: Option<JobId>,
    ) -> Result<Job, ExecutionError> {
        let (target, generation) = if backend_type.is_remote() {
            let (target, generation) = self.connections.binding().await?;
            (Some(target.to_string()), Some(generation))
        } else {
            (None, None)
        };
        let backend = self.build_backend(backend_type, generation, hpc)?;
        let estimator = self.estimator_for(&spec);
        let id = Uuid::new_v4();
        let output_dir = backend.output_dir(id, &spec);
        let unit = spec.unit.to_string();

        let job = JobRepo::insert(
            self.pool(),
            &NewJob {
                id,
                backend_type,
                spec,
                output_dir,
                session_generation: generation.map(to_db_generation),
                session_target: target,
                batch_id,
            },
        )
        .await?;

        tracing::info!(job_id = %job.id, unit = %unit, backend = %backend_type, "Job accepted");
        self.audit()
            .record(
                AuditEvent::JobSubmitted,
                Some(job.id),
                json!({
                    "unit": unit,
                    "backend": backend_type,
                    "inputs": job.input_files.0,
                    "batch_id": batch_id,
                }),
            )
            .await;
        self.ctx.spawn(&job, backend, generation, estimator);
        Ok(job)
    }

    /// Limits of the target plus the request with cluster defaults applied.
    async fn prepare_request(
        &self,
        mut request: JobRequest,
        backend_type: BackendType,
        hpc: &HpcSettings,
    ) -> Result<(HostLimits, JobRequest), ExecutionError> {
        let limits = match backend_type {
            BackendType::Local => self.ctx.settings.local_limits.clone(),
            BackendType::RemoteDocker => {
                let info = self.connections.system_info().await?;
                HostLimits {
                    max_cpus: info.cpu_count.max(1),
                    max_memory_gb: info.memory_gb.max(1),
                    gpu_available: info.gpu_count > 0,
                    max_time_hours: None,
                }
            }
            BackendType::Slurm => {
                let overrides = &mut request.resources;
                let partition = overrides
                    .partition
                    .get_or_insert_with(|| hpc.partition.clone())
                    .clone();
                if overrides.account.is_none() {
                    overrides.account = hpc.account.clone();
                }
                if overrides.qos.is_none() {
                    overrides.qos = hpc.qos.clone();
                }
                if overrides.work_dir.is_none() {
                    overrides.work_dir = Some(hpc.work_dir.clone());
                }
                self.partition_limits(&partition).await?
            }
        };
        Ok((limits, request))
    }

    async fn partition_limits(&self, name: &str) -> Result<HostLimits, ExecutionError> {
        let mut partitions = self.connections.cached_partitions().await;
        if partitions.is_empty() {
            partitions = self.connections.list_partitions().await?;
        }
        partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.host_limits())
            .ok_or_else(|| {
                let known: Vec<&str> = partitions.iter().map(|p| p.name.as_str()).collect();
                CoreError::Validation(format!(
                    "Unknown partition '{name}' (available: {})",
                    known.join(", ")
                ))
                .into()
            })
    }

    async fn matching_inputs(
        &self,
        backend_type: BackendType,
        directory: &str,
        pattern: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        let names: Vec<String> = if backend_type.is_remote() {
            self.connections
                .browse(directory)
                .await?
                .entries
                .into_iter()
                .filter(|e| !e.entry.is_dir)
                .map(|e| e.entry.name)
                .collect()
        } else {
            let mut dir = tokio::fs::read_dir(directory).await.map_err(|e| {
                CoreError::Validation(format!("Directory {directory} cannot be read: {e}"))
            })?;
            let mut names = Vec::new();
            while let Some(entry) = dir.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names
        };
        let base = directory.trim_end_matches('/');
        let mut inputs: Vec<String> = names
            .into_iter()
            .filter(|name| wildcard_match(pattern, name))
            .map(|name| format!("{base}/{name}"))
            .collect();
        inputs.sort();
        Ok(inputs)
    }

    fn build_backend(
        &self,
        backend_type: BackendType,
        generation: Option<u64>,
        hpc: &HpcSettings,
    ) -> Result<Arc<dyn ExecutionBackend>, ExecutionError> {
        let settings = &self.ctx.settings;
        let backend: Arc<dyn ExecutionBackend> = match backend_type {
            BackendType::Local => Arc::new(DockerBackend::local(Arc::clone(&self.runner), settings)),
            BackendType::RemoteDocker => Arc::new(DockerBackend::remote(
                Arc::clone(&self.connections),
                generation.ok_or(ConnectionError::NotConnected)?,
                &hpc.work_dir,
                settings,
            )),
            BackendType::Slurm => Arc::new(SlurmBackend::new(
                Arc::clone(&self.connections),
                generation.ok_or(ConnectionError::NotConnected)?,
                hpc.clone(),
                settings,
            )),
        };
        Ok(backend)
    }

    /// The supervising backend of `job`, or a fresh one on the current
    /// session for jobs nobody is watching. A remote job is only reached
    /// through a session to the target it was submitted through.
    async fn backend_for(&self, job: &Job) -> Result<Arc<dyn ExecutionBackend>, ExecutionError> {
        if let Some(supervised) = self.ctx.lookup(job.id) {
            return Ok(supervised.backend);
        }
        let generation = if job.backend_type().is_remote() {
            let (target, generation) = self.connections.binding().await?;
            let target = target.to_string();
            if let Some(submitted) = job.session_target.as_deref().filter(|t| *t != target) {
                return Err(CoreError::Conflict(format!(
                    "Job was submitted via {submitted}; connect to it instead of {target}"
                ))
                .into());
            }
            Some(generation)
        } else {
            None
        };
        let hpc = self.selection.read().await.hpc.clone();
        self.build_backend(job.backend_type(), generation, &hpc)
    }

    fn estimator_for(&self, spec: &ResolvedJobSpec) -> ProgressEstimator {
        ProgressEstimator::new(phase_table(&self.registry.snapshot(), &spec.unit))
    }

    // -----------------------------------------------------------------------
    // Queries and control
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: JobId) -> Result<Job, ExecutionError> {
        JobRepo::find_by_id(self.pool(), id)
            .await?
            .ok_or_else(|| job_not_found(id))
    }

    pub async fn list(&self, query: &JobListQuery) -> Result<Vec<Job>, ExecutionError> {
        Ok(JobRepo::list(self.pool(), query).await?)
    }

    pub async fn list_progress(&self) -> Result<Vec<JobProgress>, ExecutionError> {
        Ok(JobRepo::list_active_progress(self.pool()).await?)
    }

    pub async fn list_batch(&self, batch_id: JobId) -> Result<Vec<Job>, ExecutionError> {
        Ok(JobRepo::list_batch(self.pool(), batch_id).await?)
    }

    /// Cancel a job. A job that already ended, or ends before the stop
    /// reaches its backend, yields [`ExecutionError::AlreadyTerminal`].
    pub async fn cancel(&self, id: JobId) -> Result<Job, ExecutionError> {
        let job = self.get(id).await?;
        if job.is_terminal() {
            return Err(ExecutionError::AlreadyTerminal {
                status: job.status(),
            });
        }

        match job.backend_job_id.clone() {
            None => {
                if let Some(supervised) = self.ctx.lookup(id) {
                    supervised.stop.cancel();
                }
                if JobRepo::cancel(self.pool(), id, Some(USER_CANCEL_REASON)).await? {
                    tracing::info!(job_id = %id, "Queued job cancelled");
                    self.audit()
                        .record(AuditEvent::JobCancelled, Some(id), json!({ "reason": USER_CANCEL_REASON }))
                        .await;
                }
            }
            Some(backend_job_id) => {
                let backend = self.backend_for(&job).await?;
                if let Some(supervised) = self.ctx.lookup(id) {
                    supervised.stop.cancel();
                }
                let handle = BackendHandle {
                    backend_job_id,
                    output_dir: job.output_dir.clone(),
                };
                cancel_job(&self.ctx, backend.as_ref(), id, &handle).await?;
            }
        }

        let job = self.get(id).await?;
        match job.status() {
            JobStatus::Cancelled => Ok(job),
            status => Err(ExecutionError::AlreadyTerminal { status }),
        }
    }

    /// Remove a finished job from listings. Output files are left alone.
    pub async fn delete(&self, id: JobId) -> Result<(), ExecutionError> {
        let job = self.get(id).await?;
        if !job.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "Job is {}; cancel it before deleting",
                job.status()
            ))
            .into());
        }
        if JobRepo::soft_delete(self.pool(), id).await? {
            tracing::info!(job_id = %id, "Job record deleted");
            self.audit()
                .record(AuditEvent::JobDeleted, Some(id), json!({ "output_dir": job.output_dir }))
                .await;
        }
        Ok(())
    }

    pub async fn logs(&self, id: JobId) -> Result<JobLogs, ExecutionError> {
        let job = self.get(id).await?;
        let Some(backend_job_id) = job.backend_job_id.clone() else {
            return Ok(JobLogs::default());
        };
        let backend = self.backend_for(&job).await?;
        backend
            .fetch_logs(&BackendHandle {
                backend_job_id,
                output_dir: job.output_dir,
            })
            .await
    }

    pub async fn outputs(&self, id: JobId) -> Result<Vec<JobOutput>, ExecutionError> {
        self.get(id).await?;
        Ok(OutputRepo::list_for_job(self.pool(), id).await?)
    }

    /// Contents and file name of one file under the job's output directory.
    ///
    /// `relative_path` must stay inside the directory. Local files are also
    /// resolved through symlinks before the check.
    pub async fn output_file(&self, id: JobId, relative_path: &str) -> Result<(String, Vec<u8>), ExecutionError> {
        let job = self.get(id).await?;
        let relative = confined_relative(relative_path)?;
        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let missing = || ExecutionError::from(CoreError::not_found("Output file", relative_path));
        let path = Path::new(&job.output_dir).join(&relative);

        if !job.backend_type().is_remote() {
            let root = tokio::fs::canonicalize(&job.output_dir).await.map_err(|_| missing())?;
            let resolved = tokio::fs::canonicalize(&path).await.map_err(|_| missing())?;
            if !resolved.starts_with(&root) {
                return Err(escapes_output_dir(relative_path).into());
            }
            if !tokio::fs::metadata(&resolved).await.map_err(|_| missing())?.is_file() {
                return Err(missing());
            }
            return Ok((file_name, tokio::fs::read(&resolved).await?));
        }

        let backend = self.backend_for(&job).await?;
        let bytes = backend.host().read_file(&path.to_string_lossy()).await?;
        Ok((file_name, bytes))
    }

    pub async fn metrics(&self, id: JobId) -> Result<Value, ExecutionError> {
        let job = self.get(id).await?;
        Ok(job.metrics.map(|m| m.0).unwrap_or_else(|| json!({})))
    }

    pub async fn provenance(&self, id: JobId) -> Result<ProvenanceRecord, ExecutionError> {
        self.get(id).await?;
        ProvenanceRepo::find_by_job(self.pool(), id)
            .await?
            .map(|row| row.into_record())
            .ok_or_else(|| CoreError::not_found("Provenance", id).into())
    }

    // -----------------------------------------------------------------------
    // Backend selection
    // -----------------------------------------------------------------------

    pub async fn current_backend(&self) -> BackendSelection {
        self.selection.read().await.clone()
    }

    /// Change where new jobs go. Running jobs are unaffected.
    pub async fn switch_backend(
        &self,
        selection: BackendSelection,
    ) -> Result<BackendSelection, ExecutionError> {
        let mut current = self.selection.write().await;
        if selection.backend_type.is_remote() && !self.connections.is_connected().await {
            return Err(ConnectionError::NotConnected.into());
        }
        let previous = current.backend_type;
        *current = selection.clone();
        drop(current);

        tracing::info!(from = %previous, to = %selection.backend_type, "Active backend switched");
        self.audit()
            .record(
                AuditEvent::BackendSwitched,
                None,
                json!({ "from": previous, "to": selection.backend_type, "hpc": selection.hpc }),
            )
            .await;
        Ok(selection)
    }
}

fn job_not_found(id: JobId) -> ExecutionError {
    CoreError::not_found("Job", id).into()
}

fn to_db_generation(generation: u64) -> i64 {
    i64::try_from(generation).unwrap_or(i64::MAX)
}

/// Shell-style match supporting `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// `path` as a plain relative path, refusing anything that could leave the
/// directory it is joined to.
fn confined_relative(path: &str) -> Result<PathBuf, CoreError> {
    let mut relative = PathBuf::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escapes_output_dir(path));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(CoreError::Validation("path is required".into()));
    }
    Ok(relative)
}

fn escapes_output_dir(path: &str) -> CoreError {
    CoreError::Validation(format!("{path} is outside the job output directory"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{EXTERNAL_CANCEL_REASON, SESSION_CLOSED_WARNING};
    use crate::testing::{sample_registry, sample_spec, ScriptedRunner};
    use assert_matches::assert_matches;
    use neuroinsight_core::container::container_name;
    use neuroinsight_remote::testing::{ScriptedConnector, ScriptedSession};
    use neuroinsight_remote::{CommandOutput, SshTarget};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        runner: Arc<ScriptedRunner>,
        session: Arc<ScriptedSession>,
        manager: Arc<JobManager>,
    }

    impl Harness {
        async fn new(max_jobs: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let pool = neuroinsight_db::create_memory_pool().await.unwrap();
            neuroinsight_db::run_migrations(&pool).await.unwrap();
            let registry = Arc::new(sample_registry(dir.path()));
            let session = Arc::new(ScriptedSession::new());
            let connections = Arc::new(ConnectionManager::new(
                Arc::new(ScriptedConnector::new(Arc::clone(&session))),
                Duration::from_secs(5),
            ));
            let runner = Arc::new(ScriptedRunner::new());
            let settings = ExecutionSettings {
                data_dir: dir.path().join("data"),
                max_concurrent_jobs: max_jobs,
                status_poll: Duration::from_millis(10),
                refresh_poll: Duration::from_millis(10),
                stale_after: Duration::from_secs(5),
                orphan_after: Duration::from_secs(30),
                local_limits: HostLimits {
                    max_cpus: 8,
                    max_memory_gb: 32,
                    gpu_available: false,
                    max_time_hours: None,
                },
                ..ExecutionSettings::default()
            };
            let audit = Arc::new(AuditLog::new(dir.path().join("audit")));
            let manager = Arc::new(JobManager::new(
                pool,
                registry,
                connections,
                runner.clone(),
                audit,
                settings,
            ));
            Self {
                dir,
                runner,
                session,
                manager,
            }
        }

        fn input(&self, name: &str) -> String {
            let path = self.dir.path().join("inputs").join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, name.as_bytes()).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn request(&self, input: &str) -> JobRequest {
            JobRequest {
                unit: ExecutionUnit::Plugin("fastsurfer".into()),
                input_files: vec![input.to_string()],
                parameters: BTreeMap::new(),
                resources: ResourceOverrides::default(),
            }
        }

        async fn connect(&self) {
            self.connect_to("login.hpc", "alice").await;
        }

        async fn connect_to(&self, host: &str, username: &str) {
            self.manager
                .connections()
                .connect(SshTarget {
                    host: host.into(),
                    username: username.into(),
                    port: 22,
                })
                .await
                .unwrap();
        }

        async fn wait_until(&self, id: JobId, check: impl Fn(&Job) -> bool) -> Job {
            let waited = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let job = self.manager.get(id).await.unwrap();
                    if check(&job) {
                        return job;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            waited.expect("job never reached the expected state")
        }

        async fn wait_for(&self, id: JobId, status: JobStatus) -> Job {
            let waited = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let job = self.manager.get(id).await.unwrap();
                    if job.status() == status {
                        return job;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            match waited {
                Ok(job) => job,
                Err(_) => panic!("job {id} never reached {status}"),
            }
        }

        async fn wait_for_provenance(&self, id: JobId) -> ProvenanceRecord {
            let waited = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    if let Ok(record) = self.manager.provenance(id).await {
                        return record;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            waited.expect("provenance never recorded")
        }
    }

    #[tokio::test]
    async fn local_job_runs_to_completion_with_provenance() {
        let h = Harness::new(2).await;
        h.runner.once("docker inspect", CommandOutput::ok("created 0"));
        h.runner.once("docker inspect", CommandOutput::ok("running 0"));
        h.runner.on("docker inspect", CommandOutput::ok("exited 0"));
        let input = h.input("sub-01_T1w.nii.gz");

        let job = h
            .manager
            .submit_request(h.request(&input), Some(BackendType::Local))
            .await
            .unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.backend_type(), BackendType::Local);

        let done = h.wait_for(job.id, JobStatus::Completed).await;
        assert_eq!(done.progress, 100);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.started_at.is_some());
        assert_eq!(
            done.backend_job_id.as_deref(),
            Some(container_name("neuroinsight", job.id).as_str())
        );

        let provenance = h.wait_for_provenance(job.id).await;
        assert_eq!(provenance.input_hashes.len(), 1);
        assert_eq!(provenance.input_hashes[0].path, input);
        assert!(provenance.reproduction_command.starts_with("docker run --rm"));

        let outputs = h.manager.outputs(job.id).await.unwrap();
        assert!(outputs.iter().any(|o| o.path == "logs/stdout.log"), "{outputs:?}");
        assert!(h.runner.count("docker rm -f") >= 2);

        let events: Vec<AuditEvent> = h
            .manager
            .audit()
            .recent(10, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert!(events.contains(&AuditEvent::JobSubmitted));
        assert!(events.contains(&AuditEvent::JobCompleted));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr_tail() {
        let h = Harness::new(2).await;
        h.runner.on("docker inspect", CommandOutput::ok("exited 3"));
        h.runner.on(
            "docker logs --tail",
            CommandOutput {
                stdout: "starting\n".into(),
                stderr: "ERROR: no T1 image found\n".into(),
                exit_code: 0,
            },
        );
        let input = h.input("sub-01_T1w.nii.gz");

        let job = h.manager.submit_request(h.request(&input), Some(BackendType::Local)).await.unwrap();
        let failed = h.wait_for(job.id, JobStatus::Failed).await;
        assert_eq!(failed.exit_code, Some(3));
        let message = failed.error_message.unwrap();
        assert!(message.contains("Exited with code 3"), "{message}");
        assert!(message.contains("no T1 image found"), "{message}");
        assert!(h.manager.provenance(job.id).await.is_err());
    }

    #[tokio::test]
    async fn failed_submission_is_recorded_as_failure() {
        let h = Harness::new(2).await;
        h.runner.on("docker run -d", CommandOutput::failed(125, "docker: invalid reference format"));
        let input = h.input("sub-01_T1w.nii.gz");

        let job = h.manager.submit_request(h.request(&input), Some(BackendType::Local)).await.unwrap();
        let failed = h.wait_for(job.id, JobStatus::Failed).await;
        let message = failed.error_message.unwrap();
        assert!(message.starts_with("Submission failed"), "{message}");
        assert!(failed.backend_job_id.is_none());
    }

    #[tokio::test]
    async fn invalid_request_creates_no_record() {
        let h = Harness::new(2).await;
        let mut request = h.request(&h.input("sub-01_T1w.nii.gz"));
        request.parameters.insert("batch".into(), json!(64));

        let err = h.manager.submit_request(request, Some(BackendType::Local)).await.unwrap_err();
        assert_matches!(err, ExecutionError::Core(CoreError::Validation(_)));
        assert!(h.manager.list(&JobListQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slurm_without_session_fails_before_persisting() {
        let h = Harness::new(2).await;
        let input = h.input("sub-01_T1w.nii.gz");

        let err = h
            .manager
            .submit_request(h.request(&input), Some(BackendType::Slurm))
            .await
            .unwrap_err();
        assert_matches!(err, ExecutionError::Connection(ConnectionError::NotConnected));

        let err = h.manager.submit(sample_spec(&input), BackendType::Slurm).await.unwrap_err();
        assert_matches!(err, ExecutionError::Connection(ConnectionError::NotConnected));

        assert!(h.manager.list(&JobListQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_jobs_settle_independently() {
        let h = Harness::new(3).await;
        for name in ["sub-01_T1w.nii.gz", "sub-02_T1w.nii.gz", "sub-03_T1w.nii.gz"] {
            h.input(name);
        }
        h.input("README.txt");
        h.runner.on("docker inspect", CommandOutput::ok("exited 0"));
        h.runner.hold("docker inspect");

        let batch = h
            .manager
            .submit_batch(BatchRequest {
                unit: ExecutionUnit::Plugin("fastsurfer".into()),
                directory: h.dir.path().join("inputs").to_string_lossy().into_owned(),
                pattern: default_pattern(),
                parameters: BTreeMap::new(),
                resources: ResourceOverrides::default(),
                backend_type: Some(BackendType::Local),
            })
            .await
            .unwrap();
        assert_eq!(batch.jobs.len(), 3);
        assert!(batch.errors.is_empty());
        assert!(batch.jobs.iter().all(|j| j.batch_id == Some(batch.batch_id)));

        let doomed = batch.jobs[1].id;
        h.runner.on(
            &container_name("neuroinsight", doomed),
            CommandOutput {
                stdout: "exited 1".into(),
                stderr: "ERROR: segmentation failed".into(),
                exit_code: 0,
            },
        );
        h.runner.release();

        h.wait_for(batch.jobs[0].id, JobStatus::Completed).await;
        h.wait_for(batch.jobs[2].id, JobStatus::Completed).await;
        let failed = h.wait_for(doomed, JobStatus::Failed).await;
        assert_eq!(failed.exit_code, Some(1));
        assert_eq!(h.manager.list_batch(batch.batch_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn batch_without_matches_is_rejected() {
        let h = Harness::new(2).await;
        h.input("notes.txt");
        let err = h
            .manager
            .submit_batch(BatchRequest {
                unit: ExecutionUnit::Plugin("fastsurfer".into()),
                directory: h.dir.path().join("inputs").to_string_lossy().into_owned(),
                pattern: default_pattern(),
                parameters: BTreeMap::new(),
                resources: ResourceOverrides::default(),
                backend_type: Some(BackendType::Local),
            })
            .await
            .unwrap_err();
        assert_matches!(err, ExecutionError::Core(CoreError::Validation(_)));
    }

    fn cluster(session: &ScriptedSession) {
        session.on("test -e", CommandOutput::ok(""));
        session.on("command -v", CommandOutput::ok("podman\n"));
        session.on("sbatch", CommandOutput::ok("Submitted batch job 4242\n"));
        session.on("squeue", CommandOutput::ok("RUNNING\n"));
    }

    #[tokio::test]
    async fn switching_backend_leaves_running_slurm_job_on_slurm() {
        let h = Harness::new(2).await;
        cluster(&h.session);
        h.connect().await;
        h.manager
            .switch_backend(BackendSelection {
                backend_type: BackendType::Slurm,
                hpc: HpcSettings {
                    work_dir: "/scratch/alice".into(),
                    ..HpcSettings::default()
                },
            })
            .await
            .unwrap();

        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit(sample_spec(&input), BackendType::Slurm).await.unwrap();
        assert!(job.output_dir.starts_with("/scratch/alice/jobs/"));
        let running = h.wait_for(job.id, JobStatus::Running).await;
        assert_eq!(running.backend_job_id.as_deref(), Some("4242"));

        h.manager.switch_backend(BackendSelection::default()).await.unwrap();
        assert_eq!(h.manager.current_backend().await.backend_type, BackendType::Local);

        let polls = |s: &ScriptedSession| s.calls().iter().filter(|c| c.contains("squeue")).count();
        let before = polls(&h.session);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(polls(&h.session) > before);
        assert_eq!(h.runner.count("docker inspect"), 0);

        h.session.on("squeue", CommandOutput::ok(""));
        h.session.on("sacct", CommandOutput::ok("COMPLETED|0:0\n"));
        let done = h.wait_for(job.id, JobStatus::Completed).await;
        assert_eq!(done.backend_type(), BackendType::Slurm);
        assert_eq!(done.session_generation, Some(1));
    }

    #[tokio::test]
    async fn switching_to_remote_requires_a_session() {
        let h = Harness::new(2).await;
        let err = h
            .manager
            .switch_backend(BackendSelection {
                backend_type: BackendType::RemoteDocker,
                hpc: HpcSettings::default(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, ExecutionError::Connection(ConnectionError::NotConnected));
        assert_eq!(h.manager.current_backend().await.backend_type, BackendType::Local);
    }

    #[tokio::test]
    async fn scheduler_cancel_is_reported_as_external() {
        let h = Harness::new(2).await;
        cluster(&h.session);
        h.session.on("squeue", CommandOutput::ok(""));
        h.session.on("sacct", CommandOutput::ok("CANCELLED by 1000|0:15\n"));
        h.connect().await;

        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit(sample_spec(&input), BackendType::Slurm).await.unwrap();
        let cancelled = h.wait_for(job.id, JobStatus::Cancelled).await;
        assert_eq!(cancelled.error_message.as_deref(), Some(EXTERNAL_CANCEL_REASON));
    }

    #[tokio::test]
    async fn cancel_stops_running_job() {
        let h = Harness::new(2).await;
        h.runner.on("docker inspect", CommandOutput::ok("running 0"));
        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit_request(h.request(&input), Some(BackendType::Local)).await.unwrap();
        h.wait_for(job.id, JobStatus::Running).await;

        let cancelled = h.manager.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status(), JobStatus::Cancelled);
        assert_eq!(cancelled.error_message.as_deref(), Some(USER_CANCEL_REASON));
        assert_eq!(h.runner.count("docker stop"), 1);

        let again = h.manager.cancel(job.id).await.unwrap_err();
        assert_matches!(again, ExecutionError::AlreadyTerminal { status: JobStatus::Cancelled });
    }

    #[tokio::test]
    async fn cancel_after_natural_completion_is_already_terminal() {
        let h = Harness::new(2).await;
        h.runner.on("docker inspect", CommandOutput::ok("exited 0"));
        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit_request(h.request(&input), Some(BackendType::Local)).await.unwrap();
        h.wait_for(job.id, JobStatus::Completed).await;

        let err = h.manager.cancel(job.id).await.unwrap_err();
        assert_matches!(err, ExecutionError::AlreadyTerminal { status: JobStatus::Completed });
        assert_eq!(h.manager.get(job.id).await.unwrap().status(), JobStatus::Completed);
        assert_eq!(h.runner.count("docker stop"), 0);
    }

    #[tokio::test]
    async fn queued_job_can_be_cancelled_before_it_starts() {
        let h = Harness::new(1).await;
        h.runner.on("docker inspect", CommandOutput::ok("running 0"));
        let first = h.manager.submit_request(h.request(&h.input("sub-01_T1w.nii.gz")), Some(BackendType::Local)).await.unwrap();
        h.wait_for(first.id, JobStatus::Running).await;

        let second = h.manager.submit_request(h.request(&h.input("sub-02_T1w.nii.gz")), Some(BackendType::Local)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.manager.get(second.id).await.unwrap().status(), JobStatus::Pending);

        let cancelled = h.manager.cancel(second.id).await.unwrap();
        assert_eq!(cancelled.status(), JobStatus::Cancelled);
        assert!(cancelled.backend_job_id.is_none());
        assert_eq!(h.runner.count("docker run -d"), 1);
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let h = Harness::new(2).await;
        h.runner.on("docker inspect", CommandOutput::ok("running 0"));
        h.runner.once("docker logs --tail", CommandOutput::ok("Running FastSurferCNN on sub-01\n"));
        h.runner.on("docker logs --tail", CommandOutput::ok("starting over\n"));
        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit_request(h.request(&input), Some(BackendType::Local)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..40 {
            seen.push(h.manager.get(job.id).await.unwrap().progress);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        let current = h.manager.get(job.id).await.unwrap();
        assert_eq!(current.progress, 40);
        assert_eq!(current.current_phase.as_deref(), Some("Segmentation"));

        let active = h.manager.list_progress().await.unwrap();
        assert_eq!(active.len(), 1);
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn delete_requires_terminal_state() {
        let h = Harness::new(2).await;
        h.runner.on("docker inspect", CommandOutput::ok("running 0"));
        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit_request(h.request(&input), Some(BackendType::Local)).await.unwrap();
        h.wait_for(job.id, JobStatus::Running).await;

        let err = h.manager.delete(job.id).await.unwrap_err();
        assert_matches!(err, ExecutionError::Core(CoreError::Conflict(_)));

        h.manager.cancel(job.id).await.unwrap();
        h.manager.delete(job.id).await.unwrap();
        assert_matches!(
            h.manager.get(job.id).await.unwrap_err(),
            ExecutionError::Core(CoreError::NotFound { .. })
        );
        assert!(Path::new(&job.output_dir).exists());
    }

    async fn finished_job(h: &Harness, backend_type: BackendType, output_dir: &str) -> JobId {
        let input = h.input("sub-01_T1w.nii.gz");
        let remote = backend_type.is_remote();
        let id = Uuid::new_v4();
        JobRepo::insert(
            h.manager.pool(),
            &NewJob {
                id,
                backend_type,
                spec: sample_spec(&input),
                output_dir: output_dir.to_string(),
                session_generation: remote.then_some(1),
                session_target: remote.then(|| "alice@login.hpc:22".to_string()),
                batch_id: None,
            },
        )
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn output_files_are_confined_to_the_output_dir() {
        let h = Harness::new(2).await;
        let out = h.dir.path().join("out");
        std::fs::create_dir_all(out.join("bundle/metrics")).unwrap();
        std::fs::write(out.join("bundle/metrics/summary.json"), br#"{"volume":1}"#).unwrap();
        std::fs::write(h.dir.path().join("secret.txt"), b"nope").unwrap();
        std::os::unix::fs::symlink(h.dir.path().join("secret.txt"), out.join("link.txt")).unwrap();
        let id = finished_job(&h, BackendType::Local, &out.to_string_lossy()).await;

        let (name, bytes) = h.manager.output_file(id, "bundle/metrics/summary.json").await.unwrap();
        assert_eq!(name, "summary.json");
        assert_eq!(bytes, br#"{"volume":1}"#);

        for escape in ["../secret.txt", "/etc/passwd", "bundle/../../secret.txt", "link.txt", ""] {
            assert_matches!(
                h.manager.output_file(id, escape).await,
                Err(ExecutionError::Core(CoreError::Validation(_))),
                "{escape}"
            );
        }
        assert_matches!(
            h.manager.output_file(id, "bundle/missing.json").await,
            Err(ExecutionError::Core(CoreError::NotFound { .. }))
        );
        assert_matches!(
            h.manager.output_file(id, "bundle").await,
            Err(ExecutionError::Core(CoreError::NotFound { .. }))
        );
    }

    #[tokio::test]
    async fn remote_output_files_are_read_over_the_session() {
        let h = Harness::new(2).await;
        h.connect().await;
        h.session.put_file("/scratch/alice/jobs/run1/bundle/qc/report.html", b"<html/>");
        let id = finished_job(&h, BackendType::Slurm, "/scratch/alice/jobs/run1").await;

        let (name, bytes) = h.manager.output_file(id, "./bundle/qc/report.html").await.unwrap();
        assert_eq!(name, "report.html");
        assert_eq!(bytes, b"<html/>");
        assert_matches!(
            h.manager.output_file(id, "../run2/bundle/qc/report.html").await,
            Err(ExecutionError::Core(CoreError::Validation(_)))
        );
        assert_matches!(
            h.manager.output_file(id, "bundle/qc/absent.html").await,
            Err(ExecutionError::Connection(ConnectionError::NotFound(_)))
        );
    }

    #[tokio::test]
    async fn unfinished_local_jobs_are_reattached_on_start() {
        let h = Harness::new(2).await;
        let input = h.input("sub-01_T1w.nii.gz");
        let id = Uuid::new_v4();
        JobRepo::insert(
            h.manager.pool(),
            &NewJob {
                id,
                backend_type: BackendType::Local,
                spec: sample_spec(&input),
                output_dir: h.dir.path().join("out").to_string_lossy().into_owned(),
                session_generation: None,
                session_target: None,
                batch_id: None,
            },
        )
        .await
        .unwrap();
        JobRepo::set_backend_job_id(h.manager.pool(), id, "neuroinsight_abc").await.unwrap();
        JobRepo::mark_running(h.manager.pool(), id).await.unwrap();
        h.runner.on("docker inspect", CommandOutput::ok("exited 0"));

        h.manager.start().await.unwrap();
        h.wait_for(id, JobStatus::Completed).await;
        assert_eq!(h.runner.count("docker run -d"), 0);
        assert!(h.runner.count("docker inspect --format") >= 1);
    }

    #[tokio::test]
    async fn remote_jobs_are_reattached_on_reconnect() {
        let h = Harness::new(2).await;
        cluster(&h.session);
        h.connect().await;
        h.manager.start().await.unwrap();

        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit(sample_spec(&input), BackendType::Slurm).await.unwrap();
        h.wait_for(job.id, JobStatus::Running).await;

        h.manager.connections().disconnect().await;
        h.connect().await;

        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let job = h.manager.get(job.id).await.unwrap();
                if job.session_generation == Some(2) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "job was not re-bound to the new session");

        h.session.on("squeue", CommandOutput::ok(""));
        h.session.on("sacct", CommandOutput::ok("COMPLETED|0:0\n"));
        h.wait_for(job.id, JobStatus::Completed).await;
        let events = h.manager.audit().recent(20, Some(AuditEvent::JobReattached)).await.unwrap();
        assert_eq!(events.len(), 1);
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn remote_job_is_stale_after_disconnect() {
        let h = Harness::new(2).await;
        cluster(&h.session);
        h.connect().await;
        h.manager.start().await.unwrap();

        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit(sample_spec(&input), BackendType::Slurm).await.unwrap();
        h.wait_for(job.id, JobStatus::Running).await;
        assert_eq!(job.session_target.as_deref(), Some("alice@login.hpc:22"));

        h.manager.connections().disconnect().await;
        let stale = h
            .wait_until(job.id, |j| j.warnings.0.iter().any(|w| w == SESSION_CLOSED_WARNING))
            .await;
        assert!(stale.stale);
        assert_eq!(stale.status(), JobStatus::Running);

        h.connect().await;
        let rebound = h.wait_until(job.id, |j| j.session_generation == Some(2)).await;
        assert!(!rebound.stale);
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn jobs_from_another_cluster_are_not_reattached() {
        let h = Harness::new(2).await;
        cluster(&h.session);
        h.connect().await;
        h.manager.start().await.unwrap();

        let input = h.input("sub-01_T1w.nii.gz");
        let job = h.manager.submit(sample_spec(&input), BackendType::Slurm).await.unwrap();
        h.wait_for(job.id, JobStatus::Running).await;

        h.manager.connections().disconnect().await;
        h.session.on("squeue", CommandOutput::ok(""));
        h.session.on("sacct", CommandOutput::ok("FAILED|2:0\n"));
        h.connect_to("other-cluster", "bob").await;

        let unbound = h
            .wait_until(job.id, |j| {
                j.warnings.0.iter().any(|w| w.starts_with("Not re-attached"))
                    && j.warnings.0.iter().any(|w| w == SESSION_CLOSED_WARNING)
            })
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.manager.supervised_jobs() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(unbound.status(), JobStatus::Running);
        assert_eq!(unbound.session_generation, Some(1));
        assert!(unbound.stale);

        assert_matches!(
            h.manager.cancel(job.id).await,
            Err(ExecutionError::Core(CoreError::Conflict(_)))
        );
        assert!(!h.session.calls().iter().any(|c| c.contains("scancel")));
        assert_eq!(h.manager.get(job.id).await.unwrap().status(), JobStatus::Running);

        h.connect().await;
        let rebound = h.wait_until(job.id, |j| j.session_generation == Some(3)).await;
        assert!(!rebound.stale);
        h.wait_for(job.id, JobStatus::Failed).await;
        h.manager.shutdown();
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*.nii.gz", "sub-01_T1w.nii.gz"));
        assert!(!wildcard_match("*.nii.gz", "sub-01_T1w.nii"));
        assert!(wildcard_match("sub-0?_*", "sub-07_bold.nii"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("sub-*", "ses-01"));
    }
}
