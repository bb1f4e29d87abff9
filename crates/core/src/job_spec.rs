//! Resolved, submission-ready job descriptions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resources::ResourceAllocation;

/// Execution mode reported for a single-tool job.
pub const MODE_PLUGIN: &str = "plugin";
/// Execution mode reported for a multi-step job.
pub const MODE_WORKFLOW: &str = "workflow";

/// Reference to the definition a job executes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ExecutionUnit {
    Plugin(String),
    Workflow(String),
}

impl ExecutionUnit {
    pub fn id(&self) -> &str {
        match self {
            ExecutionUnit::Plugin(id) | ExecutionUnit::Workflow(id) => id,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            ExecutionUnit::Plugin(_) => MODE_PLUGIN,
            ExecutionUnit::Workflow(_) => MODE_WORKFLOW,
        }
    }

    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            ExecutionUnit::Plugin(id) => Some(id),
            ExecutionUnit::Workflow(_) => None,
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            ExecutionUnit::Workflow(id) => Some(id),
            ExecutionUnit::Plugin(_) => None,
        }
    }
}

impl std::fmt::Display for ExecutionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.mode(), self.id())
    }
}

/// One plugin invocation inside a job. Single-plugin jobs have one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub plugin_id: String,
    pub label: String,
    /// Stage commands with every placeholder substituted.
    pub commands: Vec<String>,
}

/// The negotiated description handed to an execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedJobSpec {
    pub unit: ExecutionUnit,
    /// Human readable name of the definition.
    pub name: String,
    pub container_image: String,
    pub input_files: Vec<String>,
    /// Parameter values after defaults were merged in.
    pub parameters: BTreeMap<String, Value>,
    pub resources: ResourceAllocation,
    pub steps: Vec<StepSpec>,
    /// Non-fatal notes from negotiation and validation.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ResolvedJobSpec {
    /// Every stage command of every step, in execution order.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|s| s.commands.iter().map(String::as_str))
    }

    /// Combine all stage commands into one fail-fast shell script body.
    pub fn script(&self) -> String {
        let mut script = String::from("set -e\n");
        for step in &self.steps {
            script.push_str(&format!("echo '>>> step {}: {}'\n", step.id, step.label.replace('\'', "")));
            for command in &step.commands {
                script.push_str(command);
                script.push('\n');
            }
        }
        script
    }

    /// Plugin ids in step order.
    pub fn step_plugins(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.plugin_id.as_str()).collect()
    }
}
