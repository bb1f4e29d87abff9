//! `docker run` invocation builder shared by the local and remote backends.

use std::path::Path;

use crate::job_spec::ResolvedJobSpec;
use crate::template::sh_quote;
use crate::types::JobId;

/// Mount point of the input files inside the container.
pub const CONTAINER_INPUT_DIR: &str = "/data/inputs";
/// Mount point of the job output directory inside the container.
pub const CONTAINER_OUTPUT_DIR: &str = "/data/outputs";

/// `<prefix>_<first 12 hex chars of the job id>`.
pub fn container_name(prefix: &str, job_id: JobId) -> String {
    let simple = job_id.simple().to_string();
    format!("{prefix}_{}", &simple[..12])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

/// A detached `docker run` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DockerRun {
    pub name: String,
    pub image: String,
    pub cpus: u32,
    pub memory_gb: u32,
    pub gpu: bool,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    /// Shell script executed with `bash -c`.
    pub script: String,
}

impl DockerRun {
    /// Build the invocation for `spec`, writing outputs to `output_dir` on the
    /// host that runs the container.
    pub fn for_job(prefix: &str, job_id: JobId, spec: &ResolvedJobSpec, output_dir: &str) -> Self {
        let alloc = &spec.resources;
        let mut mounts: Vec<Mount> = spec
            .input_files
            .iter()
            .map(|input| Mount {
                host: input.clone(),
                container: format!("{CONTAINER_INPUT_DIR}/{}", file_name(input)),
                read_only: true,
            })
            .collect();
        mounts.push(Mount {
            host: output_dir.to_string(),
            container: CONTAINER_OUTPUT_DIR.to_string(),
            read_only: false,
        });

        Self {
            name: container_name(prefix, job_id),
            image: spec.container_image.clone(),
            cpus: alloc.cpus,
            memory_gb: alloc.memory_gb,
            gpu: alloc.gpu,
            mounts,
            env: vec![
                ("OMP_NUM_THREADS".into(), alloc.omp_threads.to_string()),
                (
                    "ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS".into(),
                    alloc.threads.to_string(),
                ),
                ("NEUROINSIGHT_JOB_ID".into(), job_id.to_string()),
            ],
            script: spec.script(),
        }
    }

    /// Argument vector after the `docker` program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            format!("--cpus={}", self.cpus),
            format!("--memory={}g", self.memory_gb),
        ];
        if self.gpu {
            args.push("--gpus".into());
            args.push("all".into());
        }
        for m in &self.mounts {
            let mode = if m.read_only { "ro" } else { "rw" };
            args.push("-v".into());
            args.push(format!("{}:{}:{mode}", m.host, m.container));
        }
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args.push("bash".into());
        args.push("-c".into());
        args.push(self.script.clone());
        args
    }

    /// Single shell command line, for execution over a remote session.
    pub fn shell_command(&self) -> String {
        std::iter::once("docker".to_string())
            .chain(self.args().iter().map(|a| quote_if_needed(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The exact command a user can paste to re-run a job by hand.
pub fn reproduction_command(run: &DockerRun) -> String {
    let mut attached = run.clone();
    attached.name = format!("{}_repro", run.name);
    attached
        .shell_command()
        .replacen("docker run -d", "docker run --rm", 1)
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

fn quote_if_needed(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if safe {
        arg.to_string()
    } else {
        sh_quote(arg)
    }
}
