//! Tunables of the execution layer. Built by the API crate from the
//! environment; tests construct them directly.

use std::path::PathBuf;
use std::time::Duration;

use neuroinsight_core::resources::HostLimits;
use neuroinsight_core::status::BackendType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Local outputs live under `<data_dir>/outputs/<job_id>`.
    pub data_dir: PathBuf,
    pub container_prefix: String,
    pub max_concurrent_jobs: usize,
    /// Lightweight status poll.
    pub status_poll: Duration,
    /// Log tail refresh for phase markers.
    pub refresh_poll: Duration,
    /// Observation failures for this long flag the job as stale.
    pub stale_after: Duration,
    /// Observation failures for this long end supervision.
    pub orphan_after: Duration,
    /// Bound on ordinary container and scheduler commands.
    pub command_timeout: Duration,
    /// Bound on image pulls and archive conversions.
    pub pull_timeout: Duration,
    pub local_limits: HostLimits,
}

impl ExecutionSettings {
    pub fn outputs_root(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            container_prefix: "neuroinsight".to_string(),
            max_concurrent_jobs: 2,
            status_poll: Duration::from_secs(5),
            refresh_poll: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
            orphan_after: Duration::from_secs(1800),
            command_timeout: Duration::from_secs(120),
            pull_timeout: Duration::from_secs(3600),
            local_limits: detect_local_limits(),
        }
    }
}

/// Cluster defaults applied to Slurm submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpcSettings {
    pub work_dir: String,
    pub partition: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    /// Environment modules loaded before the container runs.
    #[serde(default)]
    pub modules: Vec<String>,
}

impl Default for HpcSettings {
    fn default() -> Self {
        Self {
            work_dir: "/scratch".to_string(),
            partition: "general".to_string(),
            account: None,
            qos: None,
            modules: Vec::new(),
        }
    }
}

/// The backend new submissions go to. Never consulted by running jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSelection {
    pub backend_type: BackendType,
    pub hpc: HpcSettings,
}

impl Default for BackendSelection {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Local,
            hpc: HpcSettings::default(),
        }
    }
}

/// CPU count from the OS, memory from `/proc/meminfo`. No GPU is assumed.
pub fn detect_local_limits() -> HostLimits {
    let max_cpus = std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
        .unwrap_or(1);
    let max_memory_gb = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| parse_meminfo_gb(&text))
        .unwrap_or(8);
    HostLimits {
        max_cpus,
        max_memory_gb,
        gpu_available: false,
        max_time_hours: None,
    }
}

fn parse_meminfo_gb(meminfo: &str) -> Option<u32> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    u32::try_from(kib / (1024 * 1024)).ok()
}
