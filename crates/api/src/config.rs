use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use neuroinsight_core::resources::HostLimits;
use neuroinsight_core::status::BackendType;
use neuroinsight_execution::settings::detect_local_limits;
use neuroinsight_execution::{BackendSelection, ExecutionSettings, HpcSettings};
use neuroinsight_remote::SshSettings;

/// A configuration variable that is set but cannot be used.
#[derive(Debug, thiserror::Error)]
#[error("{var} is invalid ({value:?}): {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for a single workstation. Deployments
/// against a cluster set the `HPC_*` variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Upper bound on draining supervision tasks after the listener stops.
    pub shutdown_timeout_secs: u64,
    pub database_url: String,
    pub plugins_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub audit_dir: PathBuf,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
    pub execution: ExecutionSettings,
    /// Backend selected at start-up.
    pub backend_type: BackendType,
    pub hpc: HpcSettings,
    /// Default `connect` target.
    pub hpc_host: Option<String>,
    pub hpc_user: Option<String>,
    pub hpc_port: u16,
    pub ssh: SshSettings,
    /// `None` disables idle auto-disconnect.
    pub ssh_idle_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                              |
    /// |----------------------------|--------------------------------------|
    /// | `HOST`                     | `0.0.0.0`                            |
    /// | `PORT`                     | `3000`                               |
    /// | `CORS_ORIGINS`             | `http://localhost:5173`              |
    /// | `REQUEST_TIMEOUT_SECS`     | `30`                                 |
    /// | `SHUTDOWN_TIMEOUT_SECS`    | `30`                                 |
    /// | `DATA_DIR`                 | `./data`                             |
    /// | `DATABASE_URL`             | `sqlite://<DATA_DIR>/neuroinsight.db`|
    /// | `PLUGINS_DIR`              | `./plugins`                          |
    /// | `WORKFLOWS_DIR`            | `./workflows`                        |
    /// | `AUDIT_DIR`                | `<DATA_DIR>/audit`                   |
    /// | `LOG_FORMAT`               | `text` (`json` for JSON lines)       |
    /// | `BACKEND_TYPE`             | `local`                              |
    /// | `MAX_CONCURRENT_JOBS`      | `2`                                  |
    /// | `STATUS_POLL_SECS`         | `5`                                  |
    /// | `REFRESH_POLL_SECS`        | `30`                                 |
    /// | `STALE_AFTER_SECS`         | `120`                                |
    /// | `ORPHAN_AFTER_SECS`        | `1800`                               |
    /// | `HPC_HOST` / `HPC_USER`    | unset                                |
    /// | `HPC_PORT`                 | `22`                                 |
    /// | `HPC_WORK_DIR`             | `/scratch`                           |
    /// | `HPC_PARTITION`            | `general`                            |
    /// | `HPC_ACCOUNT` / `HPC_QOS`  | unset                                |
    /// | `HPC_MODULES`              | unset (comma separated)              |
    /// | `SSH_CONNECT_TIMEOUT_SECS` | `15`                                 |
    /// | `SSH_COMMAND_TIMEOUT_SECS` | `120`                                |
    /// | `SSH_KEEPALIVE_SECS`       | `30`                                 |
    /// | `SSH_IDLE_TIMEOUT_SECS`    | `1800` (`0` disables)                |
    /// | `LOCAL_MAX_CPUS`           | detected                             |
    /// | `LOCAL_MAX_MEMORY_GB`      | detected                             |
    /// | `LOCAL_GPU`                | `false`                              |
    /// | `CONTAINER_PREFIX`         | `neuroinsight`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let data_dir = PathBuf::from(env.string("DATA_DIR", "./data"));
        let database_url = env
            .optional("DATABASE_URL")
            .unwrap_or_else(|| format!("sqlite://{}/neuroinsight.db", data_dir.display()));
        let audit_dir = env
            .optional("AUDIT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("audit"));

        let detected = detect_local_limits();
        let local_limits = HostLimits {
            max_cpus: env.parse("LOCAL_MAX_CPUS", detected.max_cpus)?,
            max_memory_gb: env.parse("LOCAL_MAX_MEMORY_GB", detected.max_memory_gb)?,
            gpu_available: env.parse("LOCAL_GPU", detected.gpu_available)?,
            max_time_hours: None,
        };

        let command_timeout = Duration::from_secs(env.parse("SSH_COMMAND_TIMEOUT_SECS", 120)?);
        let defaults = ExecutionSettings::default();
        let execution = ExecutionSettings {
            data_dir,
            container_prefix: env.string("CONTAINER_PREFIX", "neuroinsight"),
            max_concurrent_jobs: env.parse("MAX_CONCURRENT_JOBS", 2)?,
            status_poll: Duration::from_secs(env.parse("STATUS_POLL_SECS", 5)?),
            refresh_poll: Duration::from_secs(env.parse("REFRESH_POLL_SECS", 30)?),
            stale_after: Duration::from_secs(env.parse("STALE_AFTER_SECS", 120)?),
            orphan_after: Duration::from_secs(env.parse("ORPHAN_AFTER_SECS", 1800)?),
            command_timeout,
            pull_timeout: defaults.pull_timeout,
            local_limits,
        };
        if execution.max_concurrent_jobs == 0 {
            return Err(ConfigError {
                var: "MAX_CONCURRENT_JOBS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let hpc = HpcSettings {
            work_dir: env.string("HPC_WORK_DIR", "/scratch"),
            partition: env.string("HPC_PARTITION", "general"),
            account: env.optional("HPC_ACCOUNT"),
            qos: env.optional("HPC_QOS"),
            modules: env.list("HPC_MODULES", ""),
        };

        let ssh = SshSettings {
            connect_timeout: Duration::from_secs(env.parse("SSH_CONNECT_TIMEOUT_SECS", 15)?),
            keepalive_interval: Duration::from_secs(env.parse("SSH_KEEPALIVE_SECS", 30)?),
        };
        let idle_secs: u64 = env.parse("SSH_IDLE_TIMEOUT_SECS", 1800)?;

        Ok(Self {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 3000)?,
            cors_origins: env.list("CORS_ORIGINS", "http://localhost:5173"),
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: env.parse("SHUTDOWN_TIMEOUT_SECS", 30)?,
            database_url,
            plugins_dir: PathBuf::from(env.string("PLUGINS_DIR", "./plugins")),
            workflows_dir: PathBuf::from(env.string("WORKFLOWS_DIR", "./workflows")),
            audit_dir,
            log_json: env.string("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
            execution,
            backend_type: env.parse("BACKEND_TYPE", BackendType::Local)?,
            hpc,
            hpc_host: env.optional("HPC_HOST"),
            hpc_user: env.optional("HPC_USER"),
            hpc_port: env.parse("HPC_PORT", 22)?,
            ssh,
            ssh_idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
        })
    }

    /// The backend and cluster defaults new jobs start with.
    pub fn initial_selection(&self) -> BackendSelection {
        BackendSelection {
            backend_type: self.backend_type,
            hpc: self.hpc.clone(),
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Set and non-blank.
    fn optional(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, var: &str, default: &str) -> Vec<String> {
        self.string(var, default)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.database_url, "sqlite://./data/neuroinsight.db");
        assert_eq!(config.audit_dir, PathBuf::from("./data/audit"));
        assert_eq!(config.backend_type, BackendType::Local);
        assert_eq!(config.hpc.partition, "general");
        assert_eq!(config.hpc_port, 22);
        assert_eq!(config.ssh_idle_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.execution.status_poll, Duration::from_secs(5));
        assert!(!config.log_json);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("DATA_DIR", "/var/lib/neuroinsight"),
            ("BACKEND_TYPE", "slurm"),
            ("HPC_MODULES", "apptainer, cuda/12.1"),
            ("HPC_ACCOUNT", "neuro-lab"),
            ("SSH_IDLE_TIMEOUT_SECS", "0"),
            ("LOCAL_MAX_CPUS", "6"),
            ("LOCAL_GPU", "true"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite:///var/lib/neuroinsight/neuroinsight.db");
        assert_eq!(config.backend_type, BackendType::Slurm);
        assert_eq!(config.hpc.modules, vec!["apptainer", "cuda/12.1"]);
        assert_eq!(config.hpc.account.as_deref(), Some("neuro-lab"));
        assert_eq!(config.ssh_idle_timeout, None);
        assert_eq!(config.execution.local_limits.max_cpus, 6);
        assert!(config.execution.local_limits.gpu_available);
        assert!(config.log_json);
        assert_eq!(config.initial_selection().backend_type, BackendType::Slurm);
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = config(&[("PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "PORT");

        let err = config(&[("BACKEND_TYPE", "kubernetes")]).unwrap_err();
        assert_eq!(err.var, "BACKEND_TYPE");

        let err = config(&[("MAX_CONCURRENT_JOBS", "0")]).unwrap_err();
        assert_eq!(err.var, "MAX_CONCURRENT_JOBS");
    }
}
