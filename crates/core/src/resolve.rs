//! Job request resolution: registry lookup, input and parameter validation,
//! resource negotiation and command rendering.
//!
//! Every failure here is a [`CoreError`] raised before anything reaches an
//! execution backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::container::CONTAINER_INPUT_DIR;
use crate::error::CoreError;
use crate::job_spec::{ExecutionUnit, ResolvedJobSpec, StepSpec};
use crate::phases::PhaseTable;
use crate::registry::plugin::{InputsSpec, PluginDefinition};
use crate::registry::Registry;
use crate::resources::{
    negotiate, sequential_profile, HostLimits, Parallelization, ResourceAllocation, ResourceOverrides,
    ResourceSpec, DEFAULT_PROFILE,
};
use crate::template::{allocation_params, render, unresolved_placeholders};

/// What a caller asks to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub unit: ExecutionUnit,
    pub input_files: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: ResourceOverrides,
}

/// Resolve `request` against `registry` under `limits`.
pub fn resolve_job(
    registry: &Registry,
    request: &JobRequest,
    limits: &HostLimits,
) -> Result<ResolvedJobSpec, CoreError> {
    if let Some(key) = request.parameters.keys().find(|k| k.starts_with('_')) {
        return Err(CoreError::Validation(format!(
            "Parameter '{key}' is reserved"
        )));
    }
    if request.input_files.iter().any(|f| f.trim().is_empty()) {
        return Err(CoreError::Validation("Input file paths must not be empty".into()));
    }

    match &request.unit {
        ExecutionUnit::Plugin(id) => resolve_plugin(registry.get_plugin(id)?, request, limits),
        ExecutionUnit::Workflow(id) => resolve_workflow(registry, id, request, limits),
    }
}

fn resolve_plugin(
    plugin: &PluginDefinition,
    request: &JobRequest,
    limits: &HostLimits,
) -> Result<ResolvedJobSpec, CoreError> {
    check_inputs(&plugin.inputs, &request.input_files)?;

    let parameters = merge_parameters(plugin, &request.parameters, None)?;
    if let Some(key) = request.parameters.keys().find(|k| plugin.parameter(k).is_none()) {
        return Err(CoreError::Validation(format!(
            "Unknown parameter '{key}' for plugin '{}'",
            plugin.id
        )));
    }

    let negotiated = negotiate(&plugin.resource_spec(), &request.resources, limits)?;
    let step = render_step(plugin, &plugin.id, &plugin.name, &parameters, &negotiated.allocation, &request.input_files)?;

    Ok(ResolvedJobSpec {
        unit: request.unit.clone(),
        name: plugin.name.clone(),
        container_image: plugin.container.image.clone(),
        input_files: request.input_files.clone(),
        parameters,
        resources: negotiated.allocation,
        steps: vec![step],
        warnings: negotiated.warnings,
    })
}

fn resolve_workflow(
    registry: &Registry,
    id: &str,
    request: &JobRequest,
    limits: &HostLimits,
) -> Result<ResolvedJobSpec, CoreError> {
    let workflow = registry.get_workflow(id)?;
    check_inputs(&workflow.inputs, &request.input_files)?;
    workflow
        .run_checks(&request.input_files)
        .map_err(|errors| CoreError::Validation(errors.join("; ")))?;

    let plugins: Vec<(&str, &str, &PluginDefinition)> = workflow
        .steps
        .iter()
        .map(|s| {
            let label = if s.label.is_empty() { s.uses.as_str() } else { s.label.as_str() };
            registry.get_plugin(&s.uses).map(|p| (s.id.as_str(), label, p))
        })
        .collect::<Result<_, _>>()?;

    // Plain keys apply to every step declaring them; `step.key` targets one.
    for key in request.parameters.keys() {
        let known = match key.split_once('.') {
            Some((step_id, param)) => plugins
                .iter()
                .any(|(sid, _, p)| *sid == step_id && p.parameter(param).is_some()),
            None => plugins.iter().any(|(_, _, p)| p.parameter(key).is_some()),
        };
        if !known {
            return Err(CoreError::Validation(format!(
                "Unknown parameter '{key}' for workflow '{id}'"
            )));
        }
    }

    let spec = workflow_resource_spec(&plugins, request.resources.profile.as_deref())?;
    let overrides = ResourceOverrides {
        profile: None,
        ..request.resources.clone()
    };
    let negotiated = negotiate(&spec, &overrides, limits)?;

    let mut recorded = BTreeMap::new();
    let mut steps = Vec::with_capacity(plugins.len());
    for (step_id, label, plugin) in &plugins {
        let params = merge_parameters(plugin, &request.parameters, Some(*step_id))?;
        for (k, v) in &params {
            recorded.insert(format!("{step_id}.{k}"), v.clone());
        }
        steps.push(render_step(plugin, step_id, label, &params, &negotiated.allocation, &request.input_files)?);
    }

    let image = plugins
        .first()
        .map(|(_, _, p)| p.container.image.clone())
        .unwrap_or_default();

    Ok(ResolvedJobSpec {
        unit: request.unit.clone(),
        name: workflow.name.clone(),
        container_image: image,
        input_files: request.input_files.clone(),
        parameters: recorded,
        resources: negotiated.allocation,
        steps,
        warnings: negotiated.warnings,
    })
}

/// One allocation covering the steps' selected profiles in sequence. A named
/// profile applies to the steps that declare it; it must exist in at least one.
fn workflow_resource_spec(
    plugins: &[(&str, &str, &PluginDefinition)],
    profile: Option<&str>,
) -> Result<ResourceSpec, CoreError> {
    let name = profile.unwrap_or(DEFAULT_PROFILE);
    let mut found = name == DEFAULT_PROFILE;
    let mut union = None;
    let mut parallel = Parallelization {
        supports_threading: true,
        supports_openmp: true,
        max_useful_cpus: None,
    };

    for (_, _, plugin) in plugins {
        let spec = plugin.resource_spec();
        let selected = match spec.profile(name) {
            Some(p) => {
                found = true;
                p.clone()
            }
            None => spec.default_profile.clone(),
        };
        union = Some(match union {
            None => selected,
            Some(acc) => sequential_profile(&acc, &selected),
        });
        parallel.supports_threading &= spec.parallelization.supports_threading;
        parallel.supports_openmp &= spec.parallelization.supports_openmp;
        parallel.max_useful_cpus = match (parallel.max_useful_cpus, spec.parallelization.max_useful_cpus) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    if !found {
        return Err(CoreError::Validation(format!(
            "Unknown resource profile '{name}' for this workflow"
        )));
    }
    let default_profile = union.ok_or_else(|| {
        CoreError::Validation("Workflow declares no steps".into())
    })?;
    Ok(ResourceSpec {
        default_profile,
        profiles: BTreeMap::new(),
        parallelization: parallel,
    })
}

/// Defaults overlaid with the caller's values, each checked against its
/// declaration. With `step`, `step.key` entries take precedence.
fn merge_parameters(
    plugin: &PluginDefinition,
    requested: &BTreeMap<String, Value>,
    step: Option<&str>,
) -> Result<BTreeMap<String, Value>, CoreError> {
    let mut merged = BTreeMap::new();
    for param in &plugin.parameters {
        let scoped = step.and_then(|s| requested.get(&format!("{s}.{}", param.id)));
        let value = scoped.or_else(|| requested.get(&param.id));
        match value {
            Some(v) => {
                param.check(v).map_err(CoreError::Validation)?;
                merged.insert(param.id.clone(), v.clone());
            }
            None => {
                if let Some(default) = &param.default {
                    merged.insert(param.id.clone(), default.clone());
                }
            }
        }
    }
    Ok(merged)
}

fn check_inputs(inputs: &InputsSpec, files: &[String]) -> Result<(), CoreError> {
    let required = inputs.required.len();
    if files.len() < required.max(1) {
        return Err(CoreError::Validation(format!(
            "At least {} input file(s) required, got {}",
            required.max(1),
            files.len()
        )));
    }
    let declared = required + inputs.optional.len();
    if declared > 0 && files.len() > declared {
        return Err(CoreError::Validation(format!(
            "At most {declared} input file(s) accepted, got {}",
            files.len()
        )));
    }
    if declared > 0 {
        if let Some(bad) = files.iter().find(|f| !inputs.all().any(|i| i.accepts(f))) {
            return Err(CoreError::Validation(format!(
                "Input file '{bad}' does not match any declared input format"
            )));
        }
    }
    Ok(())
}

fn render_step(
    plugin: &PluginDefinition,
    step_id: &str,
    label: &str,
    params: &BTreeMap<String, Value>,
    alloc: &ResourceAllocation,
    input_files: &[String],
) -> Result<StepSpec, CoreError> {
    if plugin.execution.stages.is_empty() {
        return Err(CoreError::Validation(format!(
            "Plugin '{}' declares no execution stages",
            plugin.id
        )));
    }

    let mut context = allocation_params(alloc);
    if let Some(first) = input_files.first() {
        let name = first.rsplit('/').next().unwrap_or(first);
        context.insert("input_file".into(), Value::from(format!("{CONTAINER_INPUT_DIR}/{name}")));
        context.insert("input_name".into(), Value::from(strip_volume_ext(name)));
    }
    context.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut commands = Vec::with_capacity(plugin.execution.stages.len());
    for stage in &plugin.execution.stages {
        let rendered = render(&stage.command_template, &context);
        let missing = unresolved_placeholders(&rendered);
        if !missing.is_empty() {
            return Err(CoreError::Validation(format!(
                "Stage '{}' of '{}' has no value for: {}",
                stage.id,
                plugin.id,
                missing.join(", ")
            )));
        }
        commands.push(rendered);
    }

    Ok(StepSpec {
        id: step_id.to_string(),
        plugin_id: plugin.id.clone(),
        label: label.to_string(),
        commands,
    })
}

fn strip_volume_ext(name: &str) -> &str {
    [".nii.gz", ".nii", ".mgz", ".mgh"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name)
}

/// Phase table used to estimate progress for `unit`.
///
/// Workflows use their own declared phases, else their steps' tables chained
/// in order.
pub fn phase_table(registry: &Registry, unit: &ExecutionUnit) -> Option<PhaseTable> {
    match unit {
        ExecutionUnit::Plugin(id) => registry.get_plugin(id).ok()?.phase_table(),
        ExecutionUnit::Workflow(id) => {
            let wf = registry.get_workflow(id).ok()?;
            if !wf.phases.is_empty() {
                return PhaseTable::from_weights(&wf.phases).ok();
            }
            let tables: Vec<Option<PhaseTable>> = wf
                .plugin_ids()
                .map(|pid| registry.get_plugin(pid).ok().and_then(|p| p.phase_table()))
                .collect();
            PhaseTable::sequential(&tables)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::registry::plugin::tests::fastsurfer;
    use crate::registry::workflow::tests::structural;
    use crate::resources::ResourceProfile;

    fn registry() -> Registry {
        Registry::from_definitions(vec![fastsurfer()], vec![structural()])
    }

    fn limits() -> HostLimits {
        HostLimits { max_cpus: 16, max_memory_gb: 64, gpu_available: false, max_time_hours: None }
    }

    fn request(unit: ExecutionUnit) -> JobRequest {
        JobRequest {
            unit,
            input_files: vec!["/scans/sub-01_T1w.nii.gz".into()],
            parameters: BTreeMap::new(),
            resources: ResourceOverrides::default(),
        }
    }

    #[test]
    fn plugin_request_resolves_with_defaults() {
        let spec = resolve_job(&registry(), &request(ExecutionUnit::Plugin("fastsurfer".into())), &limits()).unwrap();
        assert_eq!(spec.container_image, "deepmi/fastsurfer:v2.2.0");
        assert_eq!(spec.parameters["batch"], 1);
        assert_eq!(spec.parameters["seg_only"], false);
        assert_eq!(spec.resources.cpus, 4);
        assert_eq!(
            spec.steps[0].commands[0],
            "run_fastsurfer.sh --t1 /data/inputs/T1.nii.gz --sd /data/outputs/native --threads 4 --batch 1"
        );
    }

    #[test]
    fn caller_parameters_override_defaults() {
        let mut req = request(ExecutionUnit::Plugin("fastsurfer".into()));
        req.parameters.insert("batch".into(), json!(8));
        let spec = resolve_job(&registry(), &req, &limits()).unwrap();
        assert!(spec.steps[0].commands[0].ends_with("--batch 8"));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        for (key, value) in [("batch", json!(99)), ("vox_size", json!("2")), ("nope", json!(1)), ("_command_template", json!("rm"))] {
            let mut req = request(ExecutionUnit::Plugin("fastsurfer".into()));
            req.parameters.insert(key.into(), value);
            assert_matches!(resolve_job(&registry(), &req, &limits()), Err(CoreError::Validation(_)), "{key}");
        }
    }

    #[test]
    fn inputs_are_checked_against_declarations() {
        let mut req = request(ExecutionUnit::Plugin("fastsurfer".into()));
        req.input_files.clear();
        assert_matches!(resolve_job(&registry(), &req, &limits()), Err(CoreError::Validation(_)));

        req.input_files = vec!["/scans/T1.mgz".into()];
        assert_matches!(resolve_job(&registry(), &req, &limits()), Err(CoreError::Validation(msg)) if msg.contains("format"));

        req.input_files = vec!["/a.nii".into(), "/b.nii".into()];
        assert_matches!(resolve_job(&registry(), &req, &limits()), Err(CoreError::Validation(_)));
    }

    #[test]
    fn unknown_unit_is_not_found() {
        assert_matches!(
            resolve_job(&registry(), &request(ExecutionUnit::Plugin("spm".into())), &limits()),
            Err(CoreError::NotFound { entity: "Plugin", .. })
        );
    }

    #[test]
    fn gpu_profile_without_gpu_is_rejected_before_submission() {
        let mut req = request(ExecutionUnit::Plugin("fastsurfer".into()));
        req.resources.profile = Some("gpu".into());
        assert_matches!(resolve_job(&registry(), &req, &limits()), Err(CoreError::Validation(msg)) if msg.contains("GPU"));
    }

    #[test]
    fn unresolved_placeholders_are_rejected() {
        let mut plugin = fastsurfer();
        plugin.execution.stages[0].command_template.push_str(" --sid {subject}");
        let reg = Registry::from_definitions(vec![plugin], vec![]);
        assert_matches!(
            resolve_job(&reg, &request(ExecutionUnit::Plugin("fastsurfer".into())), &limits()),
            Err(CoreError::Validation(msg)) if msg.contains("subject")
        );
    }

    #[test]
    fn workflow_resolves_steps_with_scoped_parameters() {
        let mut req = request(ExecutionUnit::Workflow("structural_segmentation".into()));
        req.parameters.insert("segment.batch".into(), json!(2));
        let spec = resolve_job(&registry(), &req, &limits()).unwrap();
        assert_eq!(spec.steps.len(), 1);
        assert_eq!(spec.steps[0].label, "Whole-brain segmentation");
        assert_eq!(spec.parameters["segment.batch"], 2);
        assert!(spec.steps[0].commands[0].ends_with("--batch 2"));
    }

    #[test]
    fn workflow_steps_add_up_wall_time() {
        let segment = fastsurfer();
        let mut surfaces = fastsurfer();
        surfaces.resources.default = ResourceProfile { cpus: 2, memory_gb: 24, time_hours: 5.0, gpu: 0 };
        surfaces.resources.profiles.clear();
        let steps = [("segment", "fastsurfer", &segment), ("surfaces", "fastsurfer", &surfaces)];

        let spec = workflow_resource_spec(&steps, None).unwrap();
        assert_eq!(
            spec.default_profile,
            ResourceProfile { cpus: 4, memory_gb: 24, time_hours: 7.0, gpu: 0 }
        );

        // Steps without the named profile fall back to their default.
        let gpu = workflow_resource_spec(&steps, Some("gpu")).unwrap();
        assert_eq!(gpu.default_profile.time_hours, 6.0);
        assert_eq!(gpu.default_profile.gpu, 1);
        assert_matches!(workflow_resource_spec(&steps, Some("huge")), Err(CoreError::Validation(_)));
    }

    #[test]
    fn workflow_validation_checks_run_before_submission() {
        let mut req = request(ExecutionUnit::Workflow("structural_segmentation".into()));
        req.input_files.push("/scans/other.nii.gz".into());
        assert_matches!(resolve_job(&registry(), &req, &limits()), Err(CoreError::Validation(_)));
    }

    #[test]
    fn phase_tables_follow_the_unit() {
        let reg = registry();
        let plugin = phase_table(&reg, &ExecutionUnit::Plugin("fastsurfer".into())).unwrap();
        assert_eq!(plugin.len(), 2);
        let wf = phase_table(&reg, &ExecutionUnit::Workflow("structural_segmentation".into())).unwrap();
        assert_eq!(wf.markers().last().unwrap().progress, 100);
    }
}
