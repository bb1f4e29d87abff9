//! Test doubles: a scripted local command runner and spec fixtures.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use neuroinsight_core::job_spec::{ExecutionUnit, ResolvedJobSpec, StepSpec};
use neuroinsight_core::registry::RegistryHandle;
use neuroinsight_core::resources::ResourceAllocation;
use neuroinsight_remote::CommandOutput;
use tokio::sync::watch;

use crate::error::ExecutionError;
use crate::runner::{display_command, CommandRunner};

struct Rule {
    pattern: String,
    reply: CommandOutput,
}

/// Answers commands from substring rules over `program arg arg ...`.
///
/// One-shot rules are consumed first, in insertion order; otherwise the most
/// recently added sticky rule wins. Unmatched commands succeed silently.
pub struct ScriptedRunner {
    once: Mutex<Vec<Rule>>,
    sticky: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    held: Mutex<Option<String>>,
    gate: watch::Sender<bool>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            once: Mutex::default(),
            sticky: Mutex::default(),
            calls: Mutex::default(),
            held: Mutex::default(),
            gate: watch::channel(true).0,
        }
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block commands containing `pattern` until [`ScriptedRunner::release`].
    pub fn hold(&self, pattern: &str) {
        if let Ok(mut held) = self.held.lock() {
            *held = Some(pattern.to_string());
        }
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn on(&self, pattern: &str, output: CommandOutput) {
        if let Ok(mut rules) = self.sticky.lock() {
            rules.push(Rule {
                pattern: pattern.to_string(),
                reply: output,
            });
        }
    }

    pub fn once(&self, pattern: &str, output: CommandOutput) {
        if let Ok(mut rules) = self.once.lock() {
            rules.push(Rule {
                pattern: pattern.to_string(),
                reply: output,
            });
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of executed commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    fn reply(&self, command: &str) -> CommandOutput {
        if let Ok(mut once) = self.once.lock() {
            if let Some(idx) = once.iter().position(|r| command.contains(&r.pattern)) {
                return once.remove(idx).reply;
            }
        }
        if let Ok(sticky) = self.sticky.lock() {
            if let Some(rule) = sticky.iter().rev().find(|r| command.contains(&r.pattern)) {
                return rule.reply.clone();
            }
        }
        CommandOutput::default()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        let command = display_command(program, args);
        let held = self
            .held
            .lock()
            .ok()
            .and_then(|h| h.clone())
            .is_some_and(|pattern| command.contains(&pattern));
        if held {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.clone());
        }
        Ok(self.reply(&command))
    }
}

/// A resolved single-plugin spec for `input`.
pub fn sample_spec(input: &str) -> ResolvedJobSpec {
    ResolvedJobSpec {
        unit: ExecutionUnit::Plugin("fastsurfer".into()),
        name: "FastSurfer".into(),
        container_image: "deepmi/fastsurfer:v2.2.0".into(),
        input_files: vec![input.to_string()],
        parameters: BTreeMap::from([
            ("batch".to_string(), serde_json::json!(1)),
            ("_license".to_string(), serde_json::json!("/opt/license.txt")),
        ]),
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
            commands: vec!["run_fastsurfer.sh --t1 /data/inputs/sub-01_T1w.nii.gz --sd /data/outputs/native".into()],
        }],
        warnings: vec![],
    }
}

/// Plugin definition with two phase markers, used by lifecycle tests.
pub const SAMPLE_PLUGIN_YAML: &str = r#"
id: fastsurfer
name: FastSurfer
type: plugin
version: "2.2.0"
domain: structural
container:
  image: deepmi/fastsurfer:v2.2.0
  runtime: docker
inputs:
  required:
    - id: t1w
      label: T1-weighted
      format: nifti
parameters:
  - id: batch
    type: integer
    default: 1
    min: 1
    max: 16
resources:
  default:
    cpus: 2
    memory_gb: 4
    time_hours: 1
execution:
  stages:
    - id: segment
      command_template: "run_fastsurfer.sh --t1 {input_dir}/T1.nii.gz --sd {output_dir}/native --threads {threads}"
phases:
  - marker: "Running FastSurferCNN"
    weight: 40
    label: Segmentation
  - marker: "recon-surf"
    weight: 60
    label: Surfaces
"#;

/// A registry loaded from `dir` holding [`SAMPLE_PLUGIN_YAML`].
pub fn sample_registry(dir: &Path) -> RegistryHandle {
    let plugins = dir.join("plugins");
    let workflows = dir.join("workflows");
    let _ = std::fs::create_dir_all(&plugins);
    let _ = std::fs::create_dir_all(&workflows);
    let _ = std::fs::write(plugins.join("fastsurfer.yaml"), SAMPLE_PLUGIN_YAML);
    RegistryHandle::load(plugins, workflows)
}
