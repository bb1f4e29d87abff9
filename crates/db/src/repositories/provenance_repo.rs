//! Repository for `provenance_records`.

use chrono::Utc;
use neuroinsight_core::provenance::ProvenanceRecord;
use neuroinsight_core::types::JobId;
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::models::provenance::ProvenanceRow;

const COLUMNS: &str = "\
    job_id, container_image, parameters, resources, input_hashes, \
    started_at, completed_at, reproduction_command, created_at";

pub struct ProvenanceRepo;

impl ProvenanceRepo {
    /// Store the record for a job. Records are immutable: a second insert for
    /// the same job is ignored and returns `false`.
    pub async fn insert(pool: &SqlitePool, record: &ProvenanceRecord) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO provenance_records (job_id, container_image, parameters, resources, \
                 input_hashes, started_at, completed_at, reproduction_command, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(record.job_id)
        .bind(&record.container_image)
        .bind(Json(&record.parameters))
        .bind(Json(&record.resources))
        .bind(Json(&record.input_hashes))
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.reproduction_command)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_job(pool: &SqlitePool, job_id: JobId) -> Result<Option<ProvenanceRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM provenance_records WHERE job_id = ?1");
        sqlx::query_as::<_, ProvenanceRow>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }
}
