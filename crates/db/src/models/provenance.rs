//! Provenance rows.

use std::collections::BTreeMap;

use neuroinsight_core::provenance::{InputHash, ProvenanceRecord};
use neuroinsight_core::resources::ResourceAllocation;
use neuroinsight_core::types::{JobId, Timestamp};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `provenance_records` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProvenanceRow {
    pub job_id: JobId,
    pub container_image: String,
    pub parameters: Json<BTreeMap<String, Value>>,
    pub resources: Json<ResourceAllocation>,
    pub input_hashes: Json<Vec<InputHash>>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub reproduction_command: String,
    pub created_at: Timestamp,
}

impl ProvenanceRow {
    pub fn into_record(self) -> ProvenanceRecord {
        ProvenanceRecord {
            job_id: self.job_id,
            container_image: self.container_image,
            parameters: self.parameters.0,
            resources: self.resources.0,
            input_hashes: self.input_hashes.0,
            started_at: self.started_at,
            completed_at: self.completed_at,
            reproduction_command: self.reproduction_command,
        }
    }
}
