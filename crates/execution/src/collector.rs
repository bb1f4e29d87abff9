//! Output collection and provenance for completed jobs.
//!
//! Collection is best-effort: anything that cannot be read becomes a warning
//! on the job. The job's exit code already decided success.

use std::path::Path;

use neuroinsight_core::hashing::sha256_file;
use neuroinsight_core::outputs::{aggregate_metrics, FileKind, OutputFile};
use neuroinsight_core::provenance::{recordable_parameters, InputHash, ProvenanceRecord};
use neuroinsight_db::models::job::Job;
use serde_json::{Map, Value};

use crate::backends::ExecutionBackend;
use crate::error::ExecutionError;

/// Metrics tables larger than this are listed but not parsed (8 MiB).
const MAX_METRICS_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub files: Vec<OutputFile>,
    pub metrics: Map<String, Value>,
    pub provenance: ProvenanceRecord,
    pub warnings: Vec<String>,
}

/// Walk the job's output directory, aggregate its metrics tables and hash
/// its inputs.
pub async fn collect(backend: &dyn ExecutionBackend, job: &Job) -> Collection {
    let mut warnings = Vec::new();

    let files = match backend.host().list_files(&job.output_dir).await {
        Ok(listing) => listing
            .into_iter()
            .map(|(path, size)| OutputFile::new(path, size))
            .collect(),
        Err(e) => {
            tracing::warn!(job_id = %job.id, output_dir = %job.output_dir, error = %e, "Output directory unreadable");
            warnings.push(format!("Output directory {} could not be read: {e}", job.output_dir));
            Vec::new()
        }
    };

    let metrics = read_metrics(backend, job, &files, &mut warnings).await;

    let mut input_hashes = Vec::with_capacity(job.input_files.len());
    for input in job.input_files.iter() {
        match hash_input(backend, input).await {
            Ok(hash) => input_hashes.push(hash),
            Err(e) => {
                tracing::warn!(job_id = %job.id, input = %input, error = %e, "Input hashing failed");
                warnings.push(format!("Input {input} could not be hashed: {e}"));
            }
        }
    }

    let spec = &job.spec.0;
    let provenance = ProvenanceRecord {
        job_id: job.id,
        container_image: job.container_image.clone(),
        parameters: recordable_parameters(&job.parameters),
        resources: job.resources.0.clone(),
        input_hashes,
        started_at: job.started_at,
        completed_at: job.completed_at,
        reproduction_command: backend.reproduction_command(job.id, spec, &job.output_dir),
    };

    tracing::info!(
        job_id = %job.id,
        files = files.len(),
        metrics = metrics.len(),
        warnings = warnings.len(),
        "Outputs collected"
    );
    Collection {
        files,
        metrics,
        provenance,
        warnings,
    }
}

async fn read_metrics(
    backend: &dyn ExecutionBackend,
    job: &Job,
    files: &[OutputFile],
    warnings: &mut Vec<String>,
) -> Map<String, Value> {
    let mut tables: Vec<(String, String)> = Vec::new();
    for file in files.iter().filter(|f| f.kind == FileKind::MetricsTable) {
        if file.size_bytes > MAX_METRICS_BYTES {
            continue;
        }
        let path = format!("{}/{}", job.output_dir, file.path);
        match backend.host().read_file(&path).await {
            Ok(bytes) => tables.push((file.path.clone(), String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) => warnings.push(format!("Metrics table {} could not be read: {e}", file.path)),
        }
    }
    aggregate_metrics(tables.iter().map(|(p, c)| (p.as_str(), c.as_str())))
}

/// Hash on the executing host, falling back to this machine for inputs
/// that were uploaded from here.
async fn hash_input(backend: &dyn ExecutionBackend, input: &str) -> Result<InputHash, ExecutionError> {
    let remote = backend.host().hash_file(input).await;
    let (sha256, size_bytes) = match remote {
        Ok(digest) => digest,
        Err(e) if !backend.host().is_local() && Path::new(input).is_file() => {
            tracing::debug!(input, error = %e, "Hashing local copy of uploaded input");
            let path = Path::new(input).to_path_buf();
            tokio::task::spawn_blocking(move || sha256_file(&path))
                .await
                .map_err(|e| ExecutionError::Backend(format!("hashing panicked: {e}")))??
        }
        Err(e) => return Err(e),
    };
    Ok(InputHash {
        path: input.to_string(),
        sha256,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DockerBackend;
    use crate::settings::ExecutionSettings;
    use crate::testing::{sample_spec, ScriptedRunner};
    use neuroinsight_core::hashing::sha256_hex;
    use neuroinsight_core::status::BackendType;
    use neuroinsight_db::models::job::NewJob;
    use neuroinsight_db::repositories::JobRepo;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn job_with(input: &str, output_dir: &str) -> Job {
        let pool = neuroinsight_db::create_memory_pool().await.unwrap();
        neuroinsight_db::run_migrations(&pool).await.unwrap();
        JobRepo::insert(
            &pool,
            &NewJob {
                id: Uuid::new_v4(),
                backend_type: BackendType::Local,
                spec: sample_spec(input),
                output_dir: output_dir.to_string(),
                session_generation: None,
                session_target: None,
                batch_id: None,
            },
        )
        .await
        .unwrap()
    }

    fn backend(dir: &Path) -> DockerBackend {
        let settings = ExecutionSettings {
            data_dir: dir.to_path_buf(),
            ..ExecutionSettings::default()
        };
        DockerBackend::local(Arc::new(ScriptedRunner::new()), &settings)
    }

    #[tokio::test]
    async fn collects_files_metrics_and_input_hash() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sub-01_T1w.nii.gz");
        std::fs::write(&input, b"nifti-bytes").unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(out.join("bundle/metrics")).unwrap();
        std::fs::create_dir_all(out.join("native/mri")).unwrap();
        std::fs::write(out.join("native/mri/aseg.mgz"), b"seg").unwrap();
        std::fs::write(out.join("bundle/metrics/volumes.csv"), "structure,volume\nHippocampus,4123.5\n").unwrap();

        let job = job_with(input.to_str().unwrap(), out.to_str().unwrap()).await;
        let collection = collect(&backend(dir.path()), &job).await;

        assert!(collection.warnings.is_empty(), "{:?}", collection.warnings);
        let kinds: Vec<(&str, FileKind)> = collection.files.iter().map(|f| (f.path.as_str(), f.kind)).collect();
        assert!(kinds.contains(&("native/mri/aseg.mgz", FileKind::Segmentation)));
        assert!(kinds.contains(&("bundle/metrics/volumes.csv", FileKind::MetricsTable)));
        assert!(collection.metrics.contains_key("volumes"));

        let prov = &collection.provenance;
        assert_eq!(prov.input_hashes.len(), 1);
        assert_eq!(prov.input_hashes[0].sha256, sha256_hex(b"nifti-bytes"));
        assert_eq!(prov.input_hashes[0].size_bytes, 11);
        assert!(prov.is_complete_for(&job.input_files));
        assert!(!prov.parameters.contains_key("_license"));
        assert!(prov.reproduction_command.starts_with("docker run --rm"));
    }

    #[tokio::test]
    async fn missing_output_dir_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sub-01_T1w.nii.gz");
        std::fs::write(&input, b"x").unwrap();
        let job = job_with(input.to_str().unwrap(), "/nonexistent/neuroinsight/out").await;

        let collection = collect(&backend(dir.path()), &job).await;
        assert!(collection.files.is_empty());
        assert_eq!(collection.warnings.len(), 1);
        assert_eq!(collection.provenance.input_hashes.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_input_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        let job = job_with("/nonexistent/sub-01.nii.gz", dir.path().join("out").to_str().unwrap()).await;

        let collection = collect(&backend(dir.path()), &job).await;
        assert!(collection.provenance.input_hashes.is_empty());
        assert!(collection.warnings[0].contains("could not be hashed"));
    }
}
