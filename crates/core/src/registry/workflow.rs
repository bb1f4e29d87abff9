//! Workflow definitions: ordered plugin steps plus pre-submission checks.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::plugin::{InputsSpec, OutputSpec, Visibility};
use crate::phases::{PhaseDecl, PhaseTable};

fn default_version() -> String {
    "0.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Plugin id this step runs.
    pub uses: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    MinInputs,
    MaxInputs,
    InputExtensions,
    DistinctInputs,
}

/// A check run against the job's inputs before anything is submitted.
///
/// Entries without `check` are descriptive only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub check: Option<CheckKind>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl ValidationCheck {
    pub fn run(&self, input_files: &[String]) -> Result<(), String> {
        let Some(kind) = self.check else {
            return Ok(());
        };
        let n = input_files.len();
        let fail = |detail: String| Err(format!("Validation '{}' failed: {detail}", self.id));
        match kind {
            CheckKind::MinInputs => {
                let min = self.count.unwrap_or(1);
                if n < min {
                    return fail(format!("at least {min} input file(s) required, got {n}"));
                }
            }
            CheckKind::MaxInputs => {
                let max = self.count.unwrap_or(1);
                if n > max {
                    return fail(format!("at most {max} input file(s) allowed, got {n}"));
                }
            }
            CheckKind::InputExtensions => {
                for file in input_files {
                    let lower = file.to_ascii_lowercase();
                    if !self.extensions.iter().any(|e| lower.ends_with(&e.to_ascii_lowercase())) {
                        return fail(format!(
                            "'{file}' does not end with one of {}",
                            self.extensions.join(", ")
                        ));
                    }
                }
            }
            CheckKind::DistinctInputs => {
                let unique: HashSet<&String> = input_files.iter().collect();
                if unique.len() != n {
                    return fail("input files must be distinct".to_string());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
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
    #[serde(default)]
    pub inputs: InputsSpec,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub validation: Vec<ValidationCheck>,
    #[serde(default)]
    pub phases: Vec<PhaseDecl>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl WorkflowDefinition {
    pub fn user_selectable(&self) -> bool {
        self.visibility.user_selectable
    }

    pub fn plugin_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.uses.as_str())
    }

    /// Run every declared check, collecting all failures.
    pub fn run_checks(&self, input_files: &[String]) -> Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validation
            .iter()
            .filter_map(|c| c.run(input_files).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Structural validation that needs no other definitions.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        }
        if self.steps.is_empty() {
            errors.push("workflow declares no steps".to_string());
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                errors.push(format!("duplicate step id '{}'", step.id));
            }
            if step.uses.trim().is_empty() {
                errors.push(format!("step '{}' does not name a plugin", step.id));
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const STRUCTURAL_YAML: &str = r#"
id: structural_segmentation
name: Structural segmentation
type: workflow
version: "1.0.0"
inputs:
  required:
    - id: t1w
      format: nifti
steps:
  - id: segment
    uses: fastsurfer
    label: Whole-brain segmentation
validation:
  - id: one_t1
    description: Exactly one T1 volume
    check: max_inputs
    count: 1
  - id: nifti_only
    check: input_extensions
    extensions: [".nii", ".nii.gz"]
  - id: visual_qc
    description: Inspect the segmentation overlay after completion
"#;

    pub(crate) fn structural() -> WorkflowDefinition {
        serde_yaml::from_str(STRUCTURAL_YAML).unwrap()
    }

    #[test]
    fn parses_steps_and_checks() {
        let wf = structural();
        assert_eq!(wf.plugin_ids().collect::<Vec<_>>(), vec!["fastsurfer"]);
        assert_eq!(wf.validation.len(), 3);
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn checks_run_against_inputs() {
        let wf = structural();
        assert!(wf.run_checks(&["/a/T1.nii.gz".into()]).is_ok());

        let errors = wf
            .run_checks(&["/a/T1.nii.gz".into(), "/a/T2.mgz".into()])
            .unwrap_err();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].contains("one_t1"));
    }

    #[test]
    fn workflow_without_steps_is_rejected() {
        let mut wf = structural();
        wf.steps.clear();
        assert!(wf.validate().is_err());
    }

    #[test]
    fn unknown_check_kind_fails_to_parse() {
        let yaml = STRUCTURAL_YAML.replace("check: max_inputs", "check: telepathy");
        assert!(serde_yaml::from_str::<WorkflowDefinition>(&yaml).is_err());
    }

    #[test]
    fn distinct_inputs_check() {
        let check = ValidationCheck {
            id: "distinct".into(),
            description: String::new(),
            check: Some(CheckKind::DistinctInputs),
            count: None,
            extensions: vec![],
        };
        assert!(check.run(&["a".into(), "b".into()]).is_ok());
        assert!(check.run(&["a".into(), "a".into()]).is_err());
    }
}
