//! Repository for the `job_outputs` manifest.

use chrono::Utc;
use neuroinsight_core::outputs::OutputFile;
use neuroinsight_core::types::JobId;
use sqlx::SqlitePool;

use crate::models::output::JobOutput;

const COLUMNS: &str = "id, job_id, path, size_bytes, kind, created_at";

pub struct OutputRepo;

impl OutputRepo {
    /// Record the collected manifest in one transaction.
    ///
    /// Paths already recorded for the job are left untouched, so a repeated
    /// collection cannot rewrite the manifest. Returns the number of new rows.
    pub async fn record(
        pool: &SqlitePool,
        job_id: JobId,
        files: &[OutputFile],
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let now = Utc::now();
        let mut inserted = 0;
        for file in files {
            let result = sqlx::query(
                "INSERT INTO job_outputs (job_id, path, size_bytes, kind, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (job_id, path) DO NOTHING",
            )
            .bind(job_id)
            .bind(&file.path)
            .bind(i64::try_from(file.size_bytes).unwrap_or(i64::MAX))
            .bind(file.kind.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Manifest of one job, ordered by path.
    pub async fn list_for_job(pool: &SqlitePool, job_id: JobId) -> Result<Vec<JobOutput>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM job_outputs WHERE job_id = ?1 ORDER BY path ASC");
        sqlx::query_as::<_, JobOutput>(&query)
            .bind(job_id)
            .fetch_all(pool)
            .await
    }
}
