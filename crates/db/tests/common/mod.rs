#![allow(dead_code)]

use std::collections::BTreeMap;

use neuroinsight_core::job_spec::{ExecutionUnit, ResolvedJobSpec, StepSpec};
use neuroinsight_core::resources::ResourceAllocation;
use neuroinsight_core::status::BackendType;
use neuroinsight_db::models::job::{Job, NewJob};
use neuroinsight_db::repositories::JobRepo;
use neuroinsight_db::DbPool;
use uuid::Uuid;

/// Fresh in-memory database with migrations applied.
pub async fn pool() -> DbPool {
    let pool = neuroinsight_db::create_memory_pool().await.unwrap();
    neuroinsight_db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn spec(input: &str) -> ResolvedJobSpec {
    ResolvedJobSpec {
        unit: ExecutionUnit::Plugin("fastsurfer".into()),
        name: "FastSurfer".into(),
        container_image: "deepmi/fastsurfer:v2.2.0".into(),
        input_files: vec![input.to_string()],
        parameters: BTreeMap::from([("batch".to_string(), serde_json::json!(1))]),
        resources: ResourceAllocation {
            memory_gb: 16,
            cpus: 4,
            time_hours: 2.0,
            gpu: false,
            threads: 4,
            omp_threads: 4,
            nodes: 1,
            partition: None,
            qos: None,
            account: None,
            work_dir: None,
        },
        steps: vec![StepSpec {
            id: "fastsurfer".into(),
            plugin_id: "fastsurfer".into(),
            label: "FastSurfer".into(),
            commands: vec!["run_fastsurfer.sh".into()],
        }],
        warnings: vec![],
    }
}

pub fn new_job(input: &str) -> NewJob {
    let id = Uuid::new_v4();
    NewJob {
        id,
        backend_type: BackendType::Local,
        spec: spec(input),
        output_dir: format!("/data/outputs/{id}"),
        session_generation: None,
        session_target: None,
        batch_id: None,
    }
}

pub async fn insert(pool: &DbPool, input: &str) -> Job {
    JobRepo::insert(pool, &new_job(input)).await.unwrap()
}
