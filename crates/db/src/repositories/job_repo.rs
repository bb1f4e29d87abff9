//! Repository for the `jobs` table.
//!
//! Every status change is a guarded `UPDATE` whose `WHERE` clause encodes the
//! legal source states, so concurrent writers (the supervisor and a cancel
//! request) can never produce an illegal transition. Guarded methods return
//! `true` when the row actually changed.

use chrono::Utc;
use neuroinsight_core::job_spec::ResolvedJobSpec;
use neuroinsight_core::phases::COMPLETED_LABEL;
use neuroinsight_core::status::{JobStatus, StatusId};
use neuroinsight_core::types::JobId;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::models::job::{Job, JobListQuery, JobProgress, NewJob};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, backend_type_id, backend_job_id, plugin_id, workflow_id, execution_mode, \
    container_image, input_files, parameters, resources, spec, \
    status_id, progress, current_phase, \
    submitted_at, started_at, completed_at, \
    output_dir, exit_code, error_message, warnings, metrics, \
    stale, last_observed_at, session_generation, session_target, batch_id, deleted_at";

/// Maximum page size for job listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
const DEFAULT_LIMIT: i64 = 50;

const PENDING: StatusId = JobStatus::Pending as StatusId;
const RUNNING: StatusId = JobStatus::Running as StatusId;

/// Provides persistence for job records.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new pending job and return the stored row.
    pub async fn insert(pool: &SqlitePool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let spec: &ResolvedJobSpec = &input.spec;
        let query = format!(
            "INSERT INTO jobs (id, backend_type_id, plugin_id, workflow_id, execution_mode, \
                 container_image, input_files, parameters, resources, spec, status_id, \
                 submitted_at, output_dir, warnings, session_generation, session_target, batch_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.id)
            .bind(input.backend_type.id())
            .bind(spec.unit.plugin_id())
            .bind(spec.unit.workflow_id())
            .bind(spec.unit.mode())
            .bind(&spec.container_image)
            .bind(Json(&spec.input_files))
            .bind(Json(&spec.parameters))
            .bind(Json(&spec.resources))
            .bind(Json(spec))
            .bind(PENDING)
            .bind(Utc::now())
            .bind(&input.output_dir)
            .bind(Json(&spec.warnings))
            .bind(input.session_generation)
            .bind(&input.session_target)
            .bind(input.batch_id)
            .fetch_one(pool)
            .await
    }

    /// Find a job by id. Soft-deleted jobs are not returned.
    pub async fn find_by_id(pool: &SqlitePool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1 AND deleted_at IS NULL");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List jobs newest first, optionally filtered by status.
    pub async fn list(pool: &SqlitePool, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);
        let status: Option<StatusId> = params.status.map(JobStatus::id);

        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE deleted_at IS NULL AND (?1 IS NULL OR status_id = ?1) \
             ORDER BY submitted_at DESC \
             LIMIT ?2 OFFSET ?3"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Progress of every pending or running job.
    pub async fn list_active_progress(pool: &SqlitePool) -> Result<Vec<JobProgress>, sqlx::Error> {
        sqlx::query_as::<_, JobProgress>(
            "SELECT id, status_id, progress, current_phase, stale, last_observed_at \
             FROM jobs \
             WHERE deleted_at IS NULL AND status_id IN (?1, ?2) \
             ORDER BY submitted_at ASC",
        )
        .bind(PENDING)
        .bind(RUNNING)
        .fetch_all(pool)
        .await
    }

    /// Every non-terminal job, oldest first. Used for re-attach on start-up.
    pub async fn list_unfinished(pool: &SqlitePool) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE deleted_at IS NULL AND status_id IN (?1, ?2) \
             ORDER BY submitted_at ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(PENDING)
            .bind(RUNNING)
            .fetch_all(pool)
            .await
    }

    /// All jobs submitted together in one batch.
    pub async fn list_batch(pool: &SqlitePool, batch_id: JobId) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE deleted_at IS NULL AND batch_id = ?1 \
             ORDER BY submitted_at ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(batch_id)
            .fetch_all(pool)
            .await
    }

    /// Record the backend-native handle (container name or scheduler id).
    pub async fn set_backend_job_id(
        pool: &SqlitePool,
        id: JobId,
        backend_job_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET backend_job_id = ?2 \
             WHERE id = ?1 AND status_id IN (?3, ?4)",
        )
        .bind(id)
        .bind(backend_job_id)
        .bind(PENDING)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bind a remote job to a session generation (submission or re-attach).
    /// Clears the staleness flag; the new supervisor observes it afresh.
    pub async fn set_session_generation(
        pool: &SqlitePool,
        id: JobId,
        generation: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET session_generation = ?2, stale = 0 \
             WHERE id = ?1 AND status_id IN (?3, ?4)",
        )
        .bind(id)
        .bind(generation)
        .bind(PENDING)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// pending -> running.
    pub async fn mark_running(pool: &SqlitePool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET status_id = ?2, started_at = ?3 \
             WHERE id = ?1 AND status_id = ?4",
        )
        .bind(id)
        .bind(RUNNING)
        .bind(Utc::now())
        .bind(PENDING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Raise progress. Never lowers it and never touches a terminal job.
    ///
    /// The phase label only moves together with a non-decreasing progress.
    pub async fn update_progress(
        pool: &SqlitePool,
        id: JobId,
        progress: i16,
        phase: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET current_phase = CASE WHEN ?2 >= progress THEN COALESCE(?3, current_phase) \
                                      ELSE current_phase END, \
                 progress = MAX(progress, ?2) \
             WHERE id = ?1 AND status_id IN (?4, ?5) \
               AND (?2 > progress OR (?2 = progress AND ?3 IS NOT NULL \
                    AND ?3 IS NOT current_phase))",
        )
        .bind(id)
        .bind(progress.clamp(0, 100))
        .bind(phase)
        .bind(PENDING)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// running -> completed. Forces progress to 100.
    pub async fn complete(pool: &SqlitePool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = ?2, completed_at = ?3, exit_code = 0, progress = 100, \
                 current_phase = ?4, stale = 0 \
             WHERE id = ?1 AND status_id = ?5",
        )
        .bind(id)
        .bind(JobStatus::Completed.id())
        .bind(Utc::now())
        .bind(COMPLETED_LABEL)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// running -> failed, with the exit code and a human-readable reason.
    pub async fn fail(
        pool: &SqlitePool,
        id: JobId,
        exit_code: Option<i32>,
        error_message: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = ?2, completed_at = ?3, exit_code = ?4, error_message = ?5, stale = 0 \
             WHERE id = ?1 AND status_id = ?6",
        )
        .bind(id)
        .bind(JobStatus::Failed.id())
        .bind(Utc::now())
        .bind(exit_code)
        .bind(error_message)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a job if it is not already in a terminal state.
    ///
    /// Returns `true` if the job was cancelled, `false` if it was already
    /// completed, failed, or cancelled.
    pub async fn cancel(
        pool: &SqlitePool,
        id: JobId,
        reason: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = ?2, completed_at = ?3, error_message = COALESCE(?4, error_message), \
                 stale = 0 \
             WHERE id = ?1 AND status_id IN (?5, ?6)",
        )
        .bind(id)
        .bind(JobStatus::Cancelled.id())
        .bind(Utc::now())
        .bind(reason)
        .bind(PENDING)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// A successful observation: clears the staleness flag.
    pub async fn touch_observed(pool: &SqlitePool, id: JobId) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET last_observed_at = ?2, stale = 0 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Flag a non-terminal job whose backend could not be observed.
    pub async fn mark_stale(pool: &SqlitePool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET stale = 1 \
             WHERE id = ?1 AND stale = 0 AND status_id IN (?2, ?3)",
        )
        .bind(id)
        .bind(PENDING)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append a non-fatal note to the job's warning list. A note already on
    /// the list is not repeated.
    pub async fn add_warning(pool: &SqlitePool, id: JobId, warning: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET warnings = json_insert(warnings, '$[#]', ?2) \
             WHERE id = ?1 \
               AND NOT EXISTS (SELECT 1 FROM json_each(jobs.warnings) WHERE value = ?2)",
        )
        .bind(id)
        .bind(warning)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Store the aggregated metrics collected from the job's outputs.
    pub async fn set_metrics(pool: &SqlitePool, id: JobId, metrics: &Value) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET metrics = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Json(metrics))
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Soft-delete a terminal job record.
    ///
    /// Returns `false` when the job is missing, already deleted, or still
    /// pending or running.
    pub async fn soft_delete(pool: &SqlitePool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET deleted_at = ?2 \
             WHERE id = ?1 AND deleted_at IS NULL AND status_id NOT IN (?3, ?4)",
        )
        .bind(id)
        .bind(Utc::now())
        .bind(PENDING)
        .bind(RUNNING)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
