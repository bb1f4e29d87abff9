//! Batch script rendering.

use neuroinsight_core::container::{DockerRun, Mount};
use neuroinsight_core::hpc::format_walltime;
use neuroinsight_core::job_spec::ResolvedJobSpec;
use neuroinsight_core::template::sh_quote;
use neuroinsight_core::types::JobId;

/// Container runtimes found on cluster nodes, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Apptainer,
    Singularity,
    Podman,
    Docker,
}

impl ContainerRuntime {
    pub const DETECTION_ORDER: [ContainerRuntime; 4] = [
        ContainerRuntime::Apptainer,
        ContainerRuntime::Singularity,
        ContainerRuntime::Podman,
        ContainerRuntime::Docker,
    ];

    pub fn program(self) -> &'static str {
        match self {
            ContainerRuntime::Apptainer => "apptainer",
            ContainerRuntime::Singularity => "singularity",
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Docker => "docker",
        }
    }

    pub fn from_program(name: &str) -> Option<Self> {
        let base = name.trim().rsplit('/').next().unwrap_or("");
        Self::DETECTION_ORDER.into_iter().find(|rt| rt.program() == base)
    }

    /// Apptainer and Singularity run local `.sif` archives, not registry
    /// references.
    pub fn needs_archive(self) -> bool {
        matches!(self, ContainerRuntime::Apptainer | ContainerRuntime::Singularity)
    }
}

/// Everything the batch script embeds.
pub struct BatchScript<'a> {
    pub job_id: JobId,
    pub spec: &'a ResolvedJobSpec,
    pub partition: &'a str,
    pub log_dir: &'a str,
    pub output_dir: &'a str,
    pub runtime: ContainerRuntime,
    /// `.sif` path for archive runtimes, registry reference otherwise.
    pub image: &'a str,
    pub modules: &'a [String],
    pub container_prefix: &'a str,
}

impl BatchScript<'_> {
    pub fn render(&self) -> String {
        let alloc = &self.spec.resources;
        let short = &self.job_id.simple().to_string()[..8];
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name=ni-{}-{short}", slug(self.spec.unit.id())),
            format!("#SBATCH --partition={}", self.partition),
        ];
        if let Some(qos) = &alloc.qos {
            lines.push(format!("#SBATCH --qos={qos}"));
        }
        if let Some(account) = &alloc.account {
            lines.push(format!("#SBATCH --account={account}"));
        }
        lines.push(format!("#SBATCH --mem={}G", alloc.memory_gb));
        lines.push(format!("#SBATCH --cpus-per-task={}", alloc.cpus));
        lines.push(format!("#SBATCH --time={}", format_walltime(alloc.time_hours)));
        lines.push("#SBATCH --nodes=1".to_string());
        if alloc.gpu {
            lines.push("#SBATCH --gres=gpu:1".to_string());
        }
        lines.push(format!("#SBATCH --output={}/slurm-%j.out", self.log_dir));
        lines.push(format!("#SBATCH --error={}/slurm-%j.err", self.log_dir));
        lines.push(String::new());
        lines.push("set -uo pipefail".to_string());
        for module in self.modules {
            lines.push(format!("module load {module}"));
        }
        lines.push(format!("export OMP_NUM_THREADS={}", alloc.omp_threads));
        lines.push(format!("export ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS={}", alloc.threads));
        lines.push(format!("export NEUROINSIGHT_JOB_ID={}", self.job_id));
        lines.push(String::new());
        lines.push(self.container_command());
        lines.push("status=$?".to_string());
        lines.push("echo \"NEUROINSIGHT_EXIT_CODE=${status}\"".to_string());
        lines.push("exit ${status}".to_string());
        lines.push(String::new());
        lines.join("\n")
    }

    /// The foreground container invocation.
    pub fn container_command(&self) -> String {
        let run = DockerRun::for_job(self.container_prefix, self.job_id, self.spec, self.output_dir);
        let script = sh_quote(&run.script);
        if self.runtime.needs_archive() {
            let mut parts = vec![self.runtime.program().to_string(), "exec".to_string(), "--cleanenv".to_string()];
            if run.gpu {
                parts.push("--nv".to_string());
            }
            for mount in &run.mounts {
                parts.push("--bind".to_string());
                parts.push(sh_quote(&bind_spec(mount)));
            }
            for (key, value) in &run.env {
                parts.push("--env".to_string());
                parts.push(sh_quote(&format!("{key}={value}")));
            }
            parts.push(sh_quote(self.image));
            parts.push(format!("bash -c {script}"));
            parts.join(" ")
        } else {
            let mut parts = vec![
                self.runtime.program().to_string(),
                "run".to_string(),
                "--rm".to_string(),
                format!("--cpus={}", run.cpus),
                format!("--memory={}g", run.memory_gb),
            ];
            if run.gpu {
                parts.push("--gpus all".to_string());
            }
            for mount in &run.mounts {
                parts.push("-v".to_string());
                let mode = if mount.read_only { "ro" } else { "rw" };
                parts.push(sh_quote(&format!("{}:{}:{mode}", mount.host, mount.container)));
            }
            for (key, value) in &run.env {
                parts.push("-e".to_string());
                parts.push(sh_quote(&format!("{key}={value}")));
            }
            parts.push(sh_quote(self.image));
            parts.push(format!("bash -c {script}"));
            parts.join(" ")
        }
    }
}

fn bind_spec(mount: &Mount) -> String {
    let mode = if mount.read_only { "ro" } else { "rw" };
    format!("{}:{}:{mode}", mount.host, mount.container)
}

/// File-system safe form of an image reference.
pub fn sanitize_image(image: &str) -> String {
    image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn slug(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .take(24)
        .collect()
}
