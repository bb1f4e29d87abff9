//! Provenance records: what ran, on what, with which settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resources::ResourceAllocation;
use crate::types::{JobId, Timestamp};

/// Digest of one input file at collection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputHash {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Immutable record created once per completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub job_id: JobId,
    pub container_image: String,
    pub parameters: BTreeMap<String, Value>,
    pub resources: ResourceAllocation,
    pub input_hashes: Vec<InputHash>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub reproduction_command: String,
}

impl ProvenanceRecord {
    /// Whether every input listed for the job was hashed.
    pub fn is_complete_for(&self, input_files: &[String]) -> bool {
        input_files
            .iter()
            .all(|f| self.input_hashes.iter().any(|h| &h.path == f))
    }

    /// Wall-clock duration of the run, when both timestamps are known.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// Parameters safe to record: internal `_`-prefixed keys are dropped.
pub fn recordable_parameters(params: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    params
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
