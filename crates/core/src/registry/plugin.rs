//! Plugin definitions: one containerized tool.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::outputs::VOLUMETRIC_EXTENSIONS;
use crate::phases::{PhaseDecl, PhaseTable};
use crate::resources::{Parallelization, ResourceProfile, ResourceSpec};

// ---------------------------------------------------------------------------
// Shared definition pieces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    #[serde(default = "default_true")]
    pub user_selectable: bool,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            user_selectable: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "0.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub format: Option<String>,
}

impl InputSpec {
    /// Whether `path` has an extension this input's format admits.
    ///
    /// Unknown or absent formats accept anything.
    pub fn accepts(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        match self.format.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("nifti") => lower.ends_with(".nii") || lower.ends_with(".nii.gz"),
            Some("mgz") => lower.ends_with(".mgz") || lower.ends_with(".mgh"),
            Some("volume") => VOLUMETRIC_EXTENSIONS.iter().any(|e| lower.ends_with(e)),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputsSpec {
    #[serde(default)]
    pub required: Vec<InputSpec>,
    #[serde(default)]
    pub optional: Vec<InputSpec>,
}

impl InputsSpec {
    pub fn all(&self) -> impl Iterator<Item = &InputSpec> {
        self.required.iter().chain(self.optional.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub format: Option<String>,
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float")]
    Number,
    String,
    #[serde(alias = "bool")]
    Boolean,
    Choice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub choices: Option<Vec<Value>>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterSpec {
    /// Check `value` against the declared type, bounds and choices.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let id = &self.id;
        match self.kind {
            ParamType::Integer => {
                if value.as_i64().is_none() {
                    return Err(format!("Parameter '{id}' must be an integer"));
                }
            }
            ParamType::Number => {
                if !value.is_number() {
                    return Err(format!("Parameter '{id}' must be a number"));
                }
            }
            ParamType::String => {
                if !value.is_string() {
                    return Err(format!("Parameter '{id}' must be a string"));
                }
            }
            ParamType::Boolean => {
                if !value.is_boolean() {
                    return Err(format!("Parameter '{id}' must be a boolean"));
                }
            }
            ParamType::Choice => {}
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("Parameter '{id}' must be >= {min}"));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("Parameter '{id}' must be <= {max}"));
                }
            }
        }

        if let Some(choices) = &self.choices {
            if !choices.contains(value) {
                let listed: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
                return Err(format!(
                    "Parameter '{id}' must be one of: {}",
                    listed.join(", ")
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plugin definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub runtime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesDecl {
    pub default: ResourceProfile,
    #[serde(default)]
    pub profiles: BTreeMap<String, ResourceProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub command_template: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDecl {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    pub container: ContainerSpec,
    #[serde(default)]
    pub inputs: InputsSpec,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub resources: ResourcesDecl,
    #[serde(default)]
    pub parallelization: Parallelization,
    #[serde(default)]
    pub execution: ExecutionDecl,
    #[serde(default)]
    pub phases: Vec<PhaseDecl>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub authors: Vec<String>,
}

impl PluginDefinition {
    pub fn user_selectable(&self) -> bool {
        self.visibility.user_selectable
    }

    pub fn parameter(&self, id: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.id == id)
    }

    pub fn resource_spec(&self) -> ResourceSpec {
        ResourceSpec {
            default_profile: self.resources.default.clone(),
            profiles: self.resources.profiles.clone(),
            parallelization: self.parallelization.clone(),
        }
    }

    /// Declared phases, else the built-in table for well-known tools.
    pub fn phase_table(&self) -> Option<PhaseTable> {
        if self.phases.is_empty() {
            PhaseTable::builtin(&self.id)
        } else {
            PhaseTable::from_weights(&self.phases).ok()
        }
    }

    /// Load-time validation. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.container.image.trim().is_empty() {
            errors.push("container.image must not be empty".to_string());
        }

        let mut profiles = vec![("default", &self.resources.default)];
        profiles.extend(self.resources.profiles.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, p) in profiles {
            if p.cpus == 0 || p.memory_gb == 0 || !(p.time_hours.is_finite() && p.time_hours > 0.0)
            {
                errors.push(format!("resource profile '{name}' must have positive cpus, memory_gb and time_hours"));
            }
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.id.as_str()) {
                errors.push(format!("duplicate parameter '{}'", param.id));
            }
            if let (Some(min), Some(max)) = (param.min, param.max) {
                if min > max {
                    errors.push(format!("parameter '{}' has min > max", param.id));
                }
            }
            if param.kind == ParamType::Choice
                && param.choices.as_ref().map_or(true, |c| c.is_empty())
            {
                errors.push(format!("choice parameter '{}' declares no choices", param.id));
            }
            if let Some(default) = &param.default {
                if let Err(e) = param.check(default) {
                    errors.push(format!("invalid default: {e}"));
                }
            }
        }

        for stage in &self.execution.stages {
            if stage.command_template.trim().is_empty() {
                errors.push(format!("stage '{}' has an empty command_template", stage.id));
            }
        }

        if !self.phases.is_empty() {
            if let Err(e) = PhaseTable::from_weights(&self.phases) {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
