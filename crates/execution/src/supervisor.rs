//! Per-job supervision: submit, observe, estimate progress, settle.
//!
//! One task per job. The task holds a concurrency slot from submission
//! until the job settles, talks only to the backend instance the job was
//! submitted with, and stops quietly when that backend's session is retired
//! so the job can be re-attached later.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use neuroinsight_core::error::CoreError;
use neuroinsight_core::job_spec::ResolvedJobSpec;
use neuroinsight_core::phases::{BackendSignal, ProgressEstimator, ProgressState};
use neuroinsight_core::status::{JobStatus, ObservedState};
use neuroinsight_core::types::{JobId, Timestamp};
use neuroinsight_db::models::job::Job;
use neuroinsight_db::repositories::{JobRepo, OutputRepo, ProvenanceRepo};
use neuroinsight_db::DbPool;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditLog};
use crate::backends::{BackendHandle, ExecutionBackend};
use crate::collector::collect;
use crate::error::{tail, ExecutionError};
use crate::settings::ExecutionSettings;

/// Lines of stderr kept in a failed job's error message.
const ERROR_TAIL_LINES: usize = 20;

/// Reason recorded when the backend reports a stop nobody asked for here.
pub const EXTERNAL_CANCEL_REASON: &str = "Cancelled outside NeuroInsight";

/// Reason recorded for a user-initiated cancel.
pub const USER_CANCEL_REASON: &str = "Cancelled by user";

/// Attached to a remote job whose session closed under it.
pub const SESSION_CLOSED_WARNING: &str =
    "Session closed; status is unknown until the cluster is reconnected";

/// A live supervision task.
#[derive(Clone)]
pub(crate) struct Supervised {
    pub backend: Arc<dyn ExecutionBackend>,
    pub stop: CancellationToken,
    /// Session generation the backend is bound to; `None` for local jobs.
    pub generation: Option<u64>,
    serial: u64,
}

/// State shared by the job manager and every supervision task.
pub(crate) struct SupervisorContext {
    pub pool: DbPool,
    pub audit: Arc<AuditLog>,
    pub settings: ExecutionSettings,
    pub slots: Arc<Semaphore>,
    pub shutdown: CancellationToken,
    supervised: Mutex<HashMap<JobId, Supervised>>,
    serial: AtomicU64,
}

impl SupervisorContext {
    pub fn new(pool: DbPool, audit: Arc<AuditLog>, settings: ExecutionSettings) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            pool,
            audit,
            settings,
            slots,
            shutdown: CancellationToken::new(),
            supervised: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
        }
    }

    /// Register a task for `job_id`, stopping any previous one.
    fn register(
        &self,
        job_id: JobId,
        backend: Arc<dyn ExecutionBackend>,
        generation: Option<u64>,
    ) -> Supervised {
        let entry = Supervised {
            backend,
            stop: self.shutdown.child_token(),
            generation,
            serial: self.serial.fetch_add(1, Ordering::Relaxed),
        };
        if let Ok(mut map) = self.supervised.lock() {
            if let Some(previous) = map.insert(job_id, entry.clone()) {
                previous.stop.cancel();
            }
        }
        entry
    }

    /// Drop the entry of a finished task unless a newer one replaced it.
    fn forget(&self, job_id: JobId, serial: u64) {
        if let Ok(mut map) = self.supervised.lock() {
            if map.get(&job_id).is_some_and(|e| e.serial == serial) {
                map.remove(&job_id);
            }
        }
    }

    pub fn lookup(&self, job_id: JobId) -> Option<Supervised> {
        self.supervised
            .lock()
            .ok()
            .and_then(|map| map.get(&job_id).cloned())
    }

    pub fn supervised_count(&self) -> usize {
        self.supervised.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Start supervising `job`. Jobs without a backend id are submitted first.
    pub fn spawn(
        self: &Arc<Self>,
        job: &Job,
        backend: Arc<dyn ExecutionBackend>,
        generation: Option<u64>,
        estimator: ProgressEstimator,
    ) {
        let entry = self.register(job.id, Arc::clone(&backend), generation);
        let handle = job.backend_job_id.clone().map(|backend_job_id| BackendHandle {
            backend_job_id,
            output_dir: job.output_dir.clone(),
        });
        let supervisor = Supervisor {
            ctx: Arc::clone(self),
            job_id: job.id,
            spec: job.spec.0.clone(),
            output_dir: job.output_dir.clone(),
            backend,
            estimator,
            state: ProgressState::resume(
                u8::try_from(job.progress.clamp(0, 100)).unwrap_or(0),
                job.current_phase.clone(),
            ),
            running: job.status() == JobStatus::Running,
            started_at: job.started_at,
            handle,
            stop: entry.stop,
            serial: entry.serial,
        };
        tokio::spawn(supervisor.run());
    }
}

struct Supervisor {
    ctx: Arc<SupervisorContext>,
    job_id: JobId,
    spec: ResolvedJobSpec,
    output_dir: String,
    backend: Arc<dyn ExecutionBackend>,
    estimator: ProgressEstimator,
    state: ProgressState,
    running: bool,
    started_at: Option<Timestamp>,
    handle: Option<BackendHandle>,
    stop: CancellationToken,
    serial: u64,
}

impl Supervisor {
    async fn run(mut self) {
        if let Err(e) = self.supervise().await {
            tracing::error!(job_id = %self.job_id, error = %e, "Job supervision ended with an error");
        }
        self.ctx.forget(self.job_id, self.serial);
    }

    async fn supervise(&mut self) -> Result<(), ExecutionError> {
        let slots = Arc::clone(&self.ctx.slots);
        let _permit = tokio::select! {
            _ = self.stop.cancelled() => return Ok(()),
            permit = slots.acquire_owned() => permit
                .map_err(|_| ExecutionError::Backend("job slots closed".into()))?,
        };

        let handle = match self.handle.clone() {
            Some(handle) => handle,
            None => match self.start().await? {
                Some(handle) => handle,
                None => return Ok(()),
            },
        };
        self.monitor(&handle).await
    }

    /// Hand the job to the backend. `None` means there is nothing to watch.
    async fn start(&mut self) -> Result<Option<BackendHandle>, ExecutionError> {
        let pool = &self.ctx.pool;
        match self.backend.submit(self.job_id, &self.spec, &self.output_dir).await {
            Ok(handle) => {
                if !JobRepo::set_backend_job_id(pool, self.job_id, &handle.backend_job_id).await? {
                    // Cancelled while the backend was accepting it.
                    tracing::info!(job_id = %self.job_id, backend_job_id = %handle.backend_job_id, "Job cancelled during submission; stopping");
                    if let Err(e) = self.backend.cancel(&handle).await {
                        tracing::warn!(job_id = %self.job_id, error = %e, "Stop after late cancel failed");
                    }
                    self.finalize(&handle).await;
                    return Ok(None);
                }
                tracing::info!(
                    job_id = %self.job_id,
                    backend = %self.backend.backend_type(),
                    backend_job_id = %handle.backend_job_id,
                    "Job submitted to backend"
                );
                Ok(Some(handle))
            }
            Err(e) if e.is_session_retired() => {
                tracing::warn!(job_id = %self.job_id, "Session retired before submission; job stays queued");
                Ok(None)
            }
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Job submission failed");
                JobRepo::mark_running(pool, self.job_id).await?;
                let message = format!("Submission failed: {e}");
                if JobRepo::fail(pool, self.job_id, None, &message).await? {
                    self.ctx
                        .audit
                        .record(AuditEvent::JobFailed, Some(self.job_id), json!({ "error": message }))
                        .await;
                }
                Ok(None)
            }
        }
    }

    async fn monitor(&mut self, handle: &BackendHandle) -> Result<(), ExecutionError> {
        let settings = &self.ctx.settings;
        let status_poll = settings.status_poll;
        let max_backoff = settings.refresh_poll.max(status_poll);
        let orphan_after = settings.orphan_after;
        let stale_after = settings.stale_after;
        let mut failing_since: Option<Instant> = None;
        let mut failures: u32 = 0;
        let mut last_refresh: Option<Instant> = None;

        loop {
            let observed = match self.backend.query_status(handle).await {
                Ok(ObservedState::Unknown { raw }) => Err(format!("unrecognised backend state '{raw}'")),
                Ok(state) => Ok(state),
                Err(e) if e.is_session_retired() => {
                    tracing::info!(job_id = %self.job_id, "Bound session retired; job left for re-attach");
                    // A re-attach that already replaced this task owns the flag.
                    if !self.stop.is_cancelled() {
                        self.flag_unobservable(SESSION_CLOSED_WARNING).await?;
                    }
                    return Ok(());
                }
                Err(e) => Err(e.to_string()),
            };

            match observed {
                Ok(state) => {
                    failures = 0;
                    failing_since = None;
                    JobRepo::touch_observed(&self.ctx.pool, self.job_id).await?;
                    match state {
                        ObservedState::Running => {
                            if !self.ensure_running().await? {
                                return Ok(());
                            }
                            self.track_progress(handle, &mut last_refresh).await?;
                        }
                        ObservedState::Exited { exit_code } => {
                            if !self.stop.is_cancelled() {
                                settle_exit(&self.ctx, self.backend.as_ref(), self.job_id, handle, exit_code).await?;
                            }
                            return Ok(());
                        }
                        ObservedState::Cancelled => {
                            if !self.stop.is_cancelled() {
                                settle_external_cancel(&self.ctx, self.backend.as_ref(), self.job_id, handle).await?;
                            }
                            return Ok(());
                        }
                        ObservedState::Pending | ObservedState::Unknown { .. } => {}
                    }
                }
                Err(reason) => {
                    failures = failures.saturating_add(1);
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    tracing::warn!(job_id = %self.job_id, failures, reason = %reason, "Job status unavailable");
                    if since.elapsed() >= orphan_after {
                        tracing::warn!(job_id = %self.job_id, "Giving up on unobservable job; it stays re-attachable");
                        self.flag_unobservable(&format!("Monitoring stopped: {reason}")).await?;
                        return Ok(());
                    }
                    if since.elapsed() >= stale_after
                        && JobRepo::mark_stale(&self.ctx.pool, self.job_id).await?
                    {
                        tracing::warn!(job_id = %self.job_id, "Job marked stale");
                    }
                }
            }

            let delay = if failures == 0 {
                status_poll
            } else {
                backoff(status_poll, failures, max_backoff)
            };
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Mark the job stale with a note; its status stays as last observed.
    async fn flag_unobservable(&self, warning: &str) -> Result<(), ExecutionError> {
        let pool = &self.ctx.pool;
        if JobRepo::mark_stale(pool, self.job_id).await? {
            tracing::warn!(job_id = %self.job_id, "Job marked stale");
        }
        JobRepo::add_warning(pool, self.job_id, warning).await?;
        Ok(())
    }

    /// pending -> running on first sight. `false` when the job settled
    /// elsewhere in the meantime.
    async fn ensure_running(&mut self) -> Result<bool, ExecutionError> {
        if self.running {
            return Ok(true);
        }
        if JobRepo::mark_running(&self.ctx.pool, self.job_id).await? {
            tracing::info!(job_id = %self.job_id, "Job running");
            self.running = true;
            self.started_at = Some(Utc::now());
            return Ok(true);
        }
        let job = JobRepo::find_by_id(&self.ctx.pool, self.job_id).await?;
        self.running = job.as_ref().is_some_and(|j| j.status() == JobStatus::Running);
        Ok(self.running)
    }

    async fn track_progress(
        &mut self,
        handle: &BackendHandle,
        last_refresh: &mut Option<Instant>,
    ) -> Result<(), ExecutionError> {
        let mut changed = false;
        if let Some(started_at) = self.started_at {
            let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
            changed |= self.estimator.estimate(
                &mut self.state,
                BackendSignal::Elapsed {
                    elapsed,
                    time_limit_hours: self.spec.resources.time_hours,
                },
            );
        }

        let due = last_refresh.map_or(true, |at| at.elapsed() >= self.ctx.settings.refresh_poll);
        if self.estimator.has_markers() && due {
            *last_refresh = Some(Instant::now());
            match self.backend.fetch_logs(handle).await {
                Ok(logs) => {
                    changed |= self
                        .estimator
                        .estimate(&mut self.state, BackendSignal::Log(&logs.combined()));
                }
                Err(e) => tracing::debug!(job_id = %self.job_id, error = %e, "Log refresh failed"),
            }
        }

        if changed {
            let progress = i16::from(self.state.progress);
            JobRepo::update_progress(&self.ctx.pool, self.job_id, progress, self.state.phase.as_deref())
                .await?;
            tracing::debug!(job_id = %self.job_id, progress, phase = ?self.state.phase, "Progress updated");
        }
        Ok(())
    }

    async fn finalize(&self, handle: &BackendHandle) {
        finalize(self.backend.as_ref(), self.job_id, handle).await;
    }
}

/// Exponential backoff with up to 25% jitter.
fn backoff(base: Duration, failures: u32, cap: Duration) -> Duration {
    let factor = 1u32 << failures.clamp(1, 6).saturating_sub(1);
    let delay = base.saturating_mul(factor).min(cap);
    let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(0);
    let jitter = if spread == 0 {
        0
    } else {
        rand::rng().random_range(0..=spread)
    };
    delay + Duration::from_millis(jitter)
}

async fn finalize(backend: &dyn ExecutionBackend, job_id: JobId, handle: &BackendHandle) {
    if let Err(e) = backend.finalize(handle).await {
        tracing::warn!(job_id = %job_id, error = %e, "Finalizing backend resources failed");
    }
}

/// Settle a job whose process ended on its own.
///
/// Returns the status the job ended in (which may have been decided by a
/// concurrent writer).
pub(crate) async fn settle_exit(
    ctx: &SupervisorContext,
    backend: &dyn ExecutionBackend,
    job_id: JobId,
    handle: &BackendHandle,
    exit_code: i32,
) -> Result<JobStatus, ExecutionError> {
    let pool = &ctx.pool;
    // Fast jobs can finish between two polls.
    JobRepo::mark_running(pool, job_id).await?;

    if exit_code == 0 {
        if JobRepo::complete(pool, job_id).await? {
            finalize(backend, job_id, handle).await;
            persist_collection(ctx, backend, job_id).await?;
            tracing::info!(job_id = %job_id, "Job completed");
            ctx.audit
                .record(AuditEvent::JobCompleted, Some(job_id), json!({ "output_dir": handle.output_dir }))
                .await;
        }
    } else {
        let message = match backend.fetch_logs(handle).await {
            Ok(logs) => failure_message(exit_code, &logs.stderr, &logs.stdout),
            Err(_) => format!("Exited with code {exit_code}"),
        };
        if JobRepo::fail(pool, job_id, Some(exit_code), &message).await? {
            finalize(backend, job_id, handle).await;
            tracing::warn!(job_id = %job_id, exit_code, "Job failed");
            ctx.audit
                .record(AuditEvent::JobFailed, Some(job_id), json!({ "exit_code": exit_code }))
                .await;
        }
    }
    current_status(pool, job_id).await
}

/// Settle a job that was stopped from outside (scheduler admin, engine).
pub(crate) async fn settle_external_cancel(
    ctx: &SupervisorContext,
    backend: &dyn ExecutionBackend,
    job_id: JobId,
    handle: &BackendHandle,
) -> Result<JobStatus, ExecutionError> {
    if JobRepo::cancel(&ctx.pool, job_id, Some(EXTERNAL_CANCEL_REASON)).await? {
        finalize(backend, job_id, handle).await;
        tracing::warn!(job_id = %job_id, "Job cancelled outside the orchestrator");
        ctx.audit
            .record(AuditEvent::JobCancelled, Some(job_id), json!({ "reason": EXTERNAL_CANCEL_REASON }))
            .await;
    }
    current_status(&ctx.pool, job_id).await
}

/// Stop a job on user request, unless its backend already reports an end.
pub(crate) async fn cancel_job(
    ctx: &SupervisorContext,
    backend: &dyn ExecutionBackend,
    job_id: JobId,
    handle: &BackendHandle,
) -> Result<JobStatus, ExecutionError> {
    match backend.query_status(handle).await {
        Ok(ObservedState::Exited { exit_code }) => {
            return settle_exit(ctx, backend, job_id, handle, exit_code).await;
        }
        Ok(ObservedState::Cancelled) => {
            return settle_external_cancel(ctx, backend, job_id, handle).await;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Status check before cancel failed"),
    }

    if let Err(e) = backend.cancel(handle).await {
        tracing::warn!(job_id = %job_id, error = %e, "Backend stop failed; cancelling anyway");
        JobRepo::add_warning(&ctx.pool, job_id, &format!("Backend stop failed: {e}")).await?;
    }
    if JobRepo::cancel(&ctx.pool, job_id, Some(USER_CANCEL_REASON)).await? {
        finalize(backend, job_id, handle).await;
        tracing::info!(job_id = %job_id, "Job cancelled");
        ctx.audit
            .record(AuditEvent::JobCancelled, Some(job_id), json!({ "reason": USER_CANCEL_REASON }))
            .await;
    }
    current_status(&ctx.pool, job_id).await
}

fn failure_message(exit_code: i32, stderr: &str, stdout: &str) -> String {
    let detail = match tail(stderr, ERROR_TAIL_LINES) {
        t if t.is_empty() => tail(stdout, ERROR_TAIL_LINES),
        t => t,
    };
    if detail.is_empty() {
        format!("Exited with code {exit_code}")
    } else {
        format!("Exited with code {exit_code}:\n{detail}")
    }
}

async fn persist_collection(
    ctx: &SupervisorContext,
    backend: &dyn ExecutionBackend,
    job_id: JobId,
) -> Result<(), ExecutionError> {
    let pool = &ctx.pool;
    let Some(job) = JobRepo::find_by_id(pool, job_id).await? else {
        return Ok(());
    };
    let collection = collect(backend, &job).await;
    OutputRepo::record(pool, job_id, &collection.files).await?;
    if !collection.metrics.is_empty() {
        JobRepo::set_metrics(pool, job_id, &Value::Object(collection.metrics)).await?;
    }
    ProvenanceRepo::insert(pool, &collection.provenance).await?;
    for warning in &collection.warnings {
        JobRepo::add_warning(pool, job_id, warning).await?;
    }
    Ok(())
}

async fn current_status(pool: &DbPool, job_id: JobId) -> Result<JobStatus, ExecutionError> {
    let job = JobRepo::find_by_id(pool, job_id)
        .await?
        .ok_or_else(|| CoreError::not_found("Job", job_id))?;
    Ok(job.status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1000);
        let first = backoff(base, 1, cap);
        assert!(first >= base && first <= base + base / 4);
        let third = backoff(base, 3, cap);
        assert!(third >= Duration::from_millis(400));
        let many = backoff(base, 30, cap);
        assert!(many >= cap && many <= cap + cap / 4);
    }

    #[test]
    fn failure_message_prefers_stderr() {
        assert_eq!(
            failure_message(1, "warning\nERROR: no T1 found\n", "stdout"),
            "Exited with code 1:\nwarning\nERROR: no T1 found"
        );
        assert_eq!(failure_message(2, "", "last words"), "Exited with code 2:\nlast words");
        assert_eq!(failure_message(137, "", ""), "Exited with code 137");
    }
}
