//! Resource negotiation.
//!
//! Merges a definition's named resource profile with user overrides and the
//! target's capacity, producing a [`ResourceAllocation`] or a validation
//! error. Negotiation is pure and backend-agnostic; the same inputs always
//! produce the same allocation.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Profile used when the caller does not name one.
pub const DEFAULT_PROFILE: &str = "default";

/// Thread count ceiling applied unless the plugin supports finer control.
pub const DEFAULT_THREAD_CAP: u32 = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A named bundle of cpu/memory/time/gpu defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpus: u32,
    pub memory_gb: u32,
    pub time_hours: f64,
    /// GPU count. Definition files may also write `gpu: true`.
    #[serde(default, deserialize_with = "deserialize_gpu_count")]
    pub gpu: u32,
}

/// Threading capabilities declared by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parallelization {
    #[serde(default)]
    pub supports_threading: bool,
    #[serde(default)]
    pub supports_openmp: bool,
    #[serde(default)]
    pub max_useful_cpus: Option<u32>,
}

/// Everything negotiation needs to know about an execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub default_profile: ResourceProfile,
    pub profiles: BTreeMap<String, ResourceProfile>,
    pub parallelization: Parallelization,
}

/// Caller-requested changes to the selected profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceOverrides {
    pub profile: Option<String>,
    pub cpus: Option<u32>,
    pub memory_gb: Option<u32>,
    pub time_hours: Option<f64>,
    pub gpu: Option<bool>,
    pub threads: Option<u32>,
    pub omp_threads: Option<u32>,
    pub nodes: Option<u32>,
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub account: Option<String>,
    pub work_dir: Option<String>,
}

/// Capacity of the target host or cluster partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostLimits {
    pub max_cpus: u32,
    pub max_memory_gb: u32,
    pub gpu_available: bool,
    /// Wall-time ceiling, when the target enforces one.
    pub max_time_hours: Option<f64>,
}

/// The negotiated, submission-ready allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub memory_gb: u32,
    pub cpus: u32,
    pub time_hours: f64,
    pub gpu: bool,
    pub threads: u32,
    pub omp_threads: u32,
    pub nodes: u32,
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub account: Option<String>,
    pub work_dir: Option<String>,
}

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub allocation: ResourceAllocation,
    /// Non-fatal adjustments (clamping, ignored overrides).
    pub warnings: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GpuField {
    Count(u32),
    Flag(bool),
}

fn deserialize_gpu_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match GpuField::deserialize(deserializer)? {
        GpuField::Count(n) => n,
        GpuField::Flag(true) => 1,
        GpuField::Flag(false) => 0,
    })
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

impl ResourceSpec {
    /// Look up a profile by name; `default` always resolves.
    pub fn profile(&self, name: &str) -> Option<&ResourceProfile> {
        if name == DEFAULT_PROFILE {
            Some(&self.default_profile)
        } else {
            self.profiles.get(name)
        }
    }

    pub fn profile_names(&self) -> Vec<&str> {
        std::iter::once(DEFAULT_PROFILE)
            .chain(self.profiles.keys().map(String::as_str))
            .collect()
    }
}

/// Negotiate an allocation for `spec` under `limits`.
///
/// CPU, memory and wall time above the limits are clamped with a warning.
/// A GPU request on a target without GPUs is rejected.
pub fn negotiate(
    spec: &ResourceSpec,
    overrides: &ResourceOverrides,
    limits: &HostLimits,
) -> Result<Negotiated, CoreError> {
    let mut warnings = Vec::new();

    let profile_name = overrides.profile.as_deref().unwrap_or(DEFAULT_PROFILE);
    let profile = spec.profile(profile_name).ok_or_else(|| {
        CoreError::Validation(format!(
            "Unknown resource profile '{profile_name}' (available: {})",
            spec.profile_names().join(", ")
        ))
    })?;

    let mut cpus = overrides.cpus.unwrap_or(profile.cpus);
    let mut memory_gb = overrides.memory_gb.unwrap_or(profile.memory_gb);
    let mut time_hours = overrides.time_hours.unwrap_or(profile.time_hours);
    let gpu = overrides.gpu.unwrap_or(profile.gpu > 0);
    let nodes = overrides.nodes.unwrap_or(1);

    if cpus == 0 {
        return Err(CoreError::Validation("cpus must be at least 1".into()));
    }
    if memory_gb == 0 {
        return Err(CoreError::Validation("memory_gb must be at least 1".into()));
    }
    if !(time_hours.is_finite() && time_hours > 0.0) {
        return Err(CoreError::Validation(
            "time_hours must be a positive number".into(),
        ));
    }
    if nodes == 0 {
        return Err(CoreError::Validation("nodes must be at least 1".into()));
    }

    if gpu && !limits.gpu_available {
        return Err(CoreError::Validation(
            "GPU requested but no GPU is available on the target".into(),
        ));
    }

    if cpus > limits.max_cpus {
        warnings.push(format!(
            "cpus reduced from {cpus} to host limit {}",
            limits.max_cpus
        ));
        cpus = limits.max_cpus.max(1);
    }
    if memory_gb > limits.max_memory_gb {
        warnings.push(format!(
            "memory_gb reduced from {memory_gb} to host limit {}",
            limits.max_memory_gb
        ));
        memory_gb = limits.max_memory_gb.max(1);
    }
    if let Some(max_time) = limits.max_time_hours {
        if time_hours > max_time {
            warnings.push(format!(
                "time_hours reduced from {time_hours} to limit {max_time}"
            ));
            time_hours = max_time;
        }
    }

    let parallel = &spec.parallelization;
    if let Some(max_useful) = parallel.max_useful_cpus {
        if cpus > max_useful {
            warnings.push(format!(
                "{cpus} cpus requested but the tool uses at most {max_useful}"
            ));
        }
    }

    let default_threads = cpus.min(DEFAULT_THREAD_CAP);
    let threads = thread_count(
        "threads",
        overrides.threads,
        parallel.supports_threading,
        cpus,
        default_threads,
        &mut warnings,
    );
    let omp_threads = thread_count(
        "omp_threads",
        overrides.omp_threads,
        parallel.supports_openmp,
        cpus,
        default_threads,
        &mut warnings,
    );

    Ok(Negotiated {
        allocation: ResourceAllocation {
            memory_gb,
            cpus,
            time_hours,
            gpu,
            threads,
            omp_threads,
            nodes,
            partition: scheduler_field("partition", &overrides.partition)?,
            qos: scheduler_field("qos", &overrides.qos)?,
            account: scheduler_field("account", &overrides.account)?,
            work_dir: scheduler_field("work_dir", &overrides.work_dir)?,
        },
        warnings,
    })
}

fn thread_count(
    field: &str,
    requested: Option<u32>,
    supported: bool,
    cpus: u32,
    default: u32,
    warnings: &mut Vec<String>,
) -> u32 {
    match requested {
        Some(n) if supported => {
            if n == 0 {
                warnings.push(format!("{field} must be at least 1, using {default}"));
                default
            } else if n > cpus {
                warnings.push(format!("{field} reduced from {n} to {cpus} cpus"));
                cpus
            } else {
                n
            }
        }
        Some(n) => {
            warnings.push(format!(
                "{field}={n} ignored: the tool does not support tuning it, using {default}"
            ));
            default
        }
        None => default,
    }
}

/// HPC-only fields are either omitted or a single non-empty token.
fn scheduler_field(name: &str, value: &Option<String>) -> Result<Option<String>, CoreError> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(CoreError::Validation(format!(
                    "{name} must be omitted or non-empty"
                )));
            }
            if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(CoreError::Validation(format!(
                    "{name} must not contain whitespace"
                )));
            }
            Ok(Some(trimmed.to_string()))
        }
    }
}

/// Allocation for two steps run one after the other in the same job: the
/// larger cpus, memory and GPU count, and the sum of the wall times.
pub fn sequential_profile(a: &ResourceProfile, b: &ResourceProfile) -> ResourceProfile {
    ResourceProfile {
        cpus: a.cpus.max(b.cpus),
        memory_gb: a.memory_gb.max(b.memory_gb),
        time_hours: a.time_hours + b.time_hours,
        gpu: a.gpu.max(b.gpu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn spec() -> ResourceSpec {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "heavy".to_string(),
            ResourceProfile { cpus: 16, memory_gb: 64, time_hours: 12.0, gpu: 0 },
        );
        profiles.insert(
            "gpu".to_string(),
            ResourceProfile { cpus: 8, memory_gb: 32, time_hours: 2.0, gpu: 1 },
        );
        ResourceSpec {
            default_profile: ResourceProfile { cpus: 4, memory_gb: 8, time_hours: 2.0, gpu: 0 },
            profiles,
            parallelization: Parallelization::default(),
        }
    }

    fn roomy() -> HostLimits {
        HostLimits { max_cpus: 32, max_memory_gb: 128, gpu_available: false, max_time_hours: None }
    }

    #[test]
    fn default_profile_is_used_without_overrides() {
        let out = negotiate(&spec(), &ResourceOverrides::default(), &roomy()).unwrap();
        assert_eq!(out.allocation.cpus, 4);
        assert_eq!(out.allocation.memory_gb, 8);
        assert_eq!(out.allocation.time_hours, 2.0);
        assert!(!out.allocation.gpu);
        assert_eq!(out.allocation.threads, 4);
        assert_eq!(out.allocation.omp_threads, 4);
        assert_eq!(out.allocation.nodes, 1);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn overrides_apply_field_by_field() {
        let overrides = ResourceOverrides {
            profile: Some("heavy".into()),
            memory_gb: Some(48),
            ..Default::default()
        };
        let out = negotiate(&spec(), &overrides, &roomy()).unwrap();
        assert_eq!(out.allocation.cpus, 16);
        assert_eq!(out.allocation.memory_gb, 48);
        assert_eq!(out.allocation.time_hours, 12.0);
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let overrides = ResourceOverrides { profile: Some("huge".into()), ..Default::default() };
        assert_matches!(
            negotiate(&spec(), &overrides, &roomy()),
            Err(CoreError::Validation(msg)) if msg.contains("huge")
        );
    }

    #[test]
    fn cpu_and_memory_are_clamped_with_warnings() {
        let limits = HostLimits { max_cpus: 8, max_memory_gb: 16, ..roomy() };
        let overrides = ResourceOverrides { profile: Some("heavy".into()), ..Default::default() };
        let out = negotiate(&spec(), &overrides, &limits).unwrap();
        assert_eq!(out.allocation.cpus, 8);
        assert_eq!(out.allocation.memory_gb, 16);
        assert_eq!(out.warnings.len(), 2);
    }

    #[test]
    fn wall_time_is_clamped_to_partition_limit() {
        let limits = HostLimits { max_time_hours: Some(4.0), ..roomy() };
        let overrides = ResourceOverrides { profile: Some("heavy".into()), ..Default::default() };
        let out = negotiate(&spec(), &overrides, &limits).unwrap();
        assert_eq!(out.allocation.time_hours, 4.0);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn gpu_request_without_gpu_is_an_error_not_a_downgrade() {
        let overrides = ResourceOverrides { profile: Some("gpu".into()), ..Default::default() };
        assert_matches!(
            negotiate(&spec(), &overrides, &roomy()),
            Err(CoreError::Validation(msg)) if msg.contains("GPU")
        );

        let limits = HostLimits { gpu_available: true, ..roomy() };
        let out = negotiate(&spec(), &overrides, &limits).unwrap();
        assert!(out.allocation.gpu);
    }

    #[test]
    fn threads_default_to_min_of_four_and_cpus() {
        let overrides = ResourceOverrides { cpus: Some(2), ..Default::default() };
        let out = negotiate(&spec(), &overrides, &roomy()).unwrap();
        assert_eq!(out.allocation.threads, 2);
        assert_eq!(out.allocation.omp_threads, 2);
    }

    #[test]
    fn thread_override_needs_plugin_support() {
        let overrides = ResourceOverrides {
            profile: Some("heavy".into()),
            threads: Some(12),
            ..Default::default()
        };
        let out = negotiate(&spec(), &overrides, &roomy()).unwrap();
        assert_eq!(out.allocation.threads, 4);
        assert_eq!(out.warnings.len(), 1);

        let mut threaded = spec();
        threaded.parallelization.supports_threading = true;
        let out = negotiate(&threaded, &overrides, &roomy()).unwrap();
        assert_eq!(out.allocation.threads, 12);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn scheduler_fields_are_present_or_omitted() {
        let overrides = ResourceOverrides {
            partition: Some(" gpu ".into()),
            account: None,
            ..Default::default()
        };
        let out = negotiate(&spec(), &overrides, &roomy()).unwrap();
        assert_eq!(out.allocation.partition.as_deref(), Some("gpu"));
        assert_eq!(out.allocation.account, None);

        let blank = ResourceOverrides { qos: Some("  ".into()), ..Default::default() };
        assert_matches!(negotiate(&spec(), &blank, &roomy()), Err(CoreError::Validation(_)));

        let spaced = ResourceOverrides { account: Some("lab a".into()), ..Default::default() };
        assert_matches!(negotiate(&spec(), &spaced, &roomy()), Err(CoreError::Validation(_)));
    }

    #[test]
    fn non_positive_values_are_rejected() {
        for overrides in [
            ResourceOverrides { cpus: Some(0), ..Default::default() },
            ResourceOverrides { memory_gb: Some(0), ..Default::default() },
            ResourceOverrides { time_hours: Some(0.0), ..Default::default() },
            ResourceOverrides { nodes: Some(0), ..Default::default() },
        ] {
            assert_matches!(negotiate(&spec(), &overrides, &roomy()), Err(CoreError::Validation(_)));
        }
    }

    #[test]
    fn negotiation_is_idempotent() {
        let overrides = ResourceOverrides {
            profile: Some("heavy".into()),
            cpus: Some(40),
            partition: Some("long".into()),
            ..Default::default()
        };
        let limits = HostLimits { max_cpus: 24, max_memory_gb: 32, ..roomy() };
        let first = negotiate(&spec(), &overrides, &limits).unwrap();
        let second = negotiate(&spec(), &overrides, &limits).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn gpu_flag_in_definition_files_parses_as_count() {
        let p: ResourceProfile =
            serde_yaml::from_str("cpus: 2\nmemory_gb: 4\ntime_hours: 1\ngpu: true\n").unwrap();
        assert_eq!(p.gpu, 1);
        let p: ResourceProfile =
            serde_yaml::from_str("cpus: 2\nmemory_gb: 4\ntime_hours: 1.5\n").unwrap();
        assert_eq!(p.gpu, 0);
        assert_eq!(p.time_hours, 1.5);
    }

    #[test]
    fn sequential_steps_share_peak_resources_and_add_time() {
        let a = ResourceProfile { cpus: 4, memory_gb: 32, time_hours: 1.0, gpu: 0 };
        let b = ResourceProfile { cpus: 8, memory_gb: 16, time_hours: 6.0, gpu: 1 };
        assert_eq!(
            sequential_profile(&a, &b),
            ResourceProfile { cpus: 8, memory_gb: 32, time_hours: 7.0, gpu: 1 }
        );
    }
}
