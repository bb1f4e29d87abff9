//! Batch-scheduler data: partitions, queue entries, state mapping.
//!
//! Parsers here consume the pipe-delimited output of `sinfo`, `squeue` and
//! `sacct` as requested by the Slurm backend and connection manager.

use serde::{Deserialize, Serialize};

use crate::resources::HostLimits;
use crate::status::ObservedState;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// `sinfo` format producing the fields [`parse_sinfo`] expects.
pub const SINFO_FORMAT: &str = "%P|%a|%l|%D|%C|%m|%G";

/// `squeue` format producing the fields [`parse_squeue`] expects.
pub const SQUEUE_FORMAT: &str = "%i|%j|%T|%M|%P|%l|%D|%R";

/// `sacctmgr` association fields producing what [`parse_associations`] expects.
pub const SACCTMGR_FORMAT: &str = "Account,Partition,QOS,DefaultQOS";

/// Wall-time ceiling assumed for partitions reporting `infinite`.
pub const UNLIMITED_PARTITION_HOURS: f64 = 168.0;

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub is_default: bool,
    pub available: bool,
    /// Raw scheduler time limit, e.g. `2-00:00:00` or `infinite`.
    pub time_limit: String,
    pub nodes: u32,
    /// CPUs as allocated/idle/other/total.
    pub cpus_total: u32,
    pub cpus_idle: u32,
    pub memory_mb: u64,
    /// Generic resources, e.g. `gpu:a100:4`; `None` when the partition has none.
    pub gres: Option<String>,
}

impl Partition {
    pub fn has_gpu(&self) -> bool {
        self.gres.as_deref().is_some_and(|g| g.contains("gpu"))
    }

    pub fn max_time_hours(&self) -> f64 {
        parse_time_limit(&self.time_limit).unwrap_or(UNLIMITED_PARTITION_HOURS)
    }

    pub fn memory_gb(&self) -> u32 {
        u32::try_from(self.memory_mb / 1024).unwrap_or(u32::MAX)
    }

    /// Capacity of one job on this partition.
    pub fn host_limits(&self) -> HostLimits {
        HostLimits {
            max_cpus: self.cpus_total.max(1),
            max_memory_gb: self.memory_gb().max(1),
            gpu_available: self.has_gpu(),
            max_time_hours: Some(self.max_time_hours()),
        }
    }
}

/// Parse `sinfo --noheader -o "%P|%a|%l|%D|%C|%m|%G"`.
///
/// Partitions listed once per node state are merged by name.
pub fn parse_sinfo(output: &str) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.trim().split('|').collect();
        if fields.len() < 7 || fields[0].is_empty() {
            continue;
        }
        let is_default = fields[0].ends_with('*');
        let name = fields[0].trim_end_matches('*').to_string();
        let cpus: Vec<u32> = fields[4]
            .split('/')
            .map(|c| c.parse().unwrap_or(0))
            .collect();
        let gres = match fields[6].trim() {
            "" | "(null)" | "0" => None,
            g => Some(g.to_string()),
        };
        let parsed = Partition {
            name,
            is_default,
            available: fields[1].eq_ignore_ascii_case("up"),
            time_limit: fields[2].to_string(),
            nodes: fields[3].parse().unwrap_or(0),
            cpus_total: cpus.get(3).copied().unwrap_or(0),
            cpus_idle: cpus.get(1).copied().unwrap_or(0),
            memory_mb: fields[5].trim_end_matches('+').parse().unwrap_or(0),
            gres,
        };

        if let Some(existing) = partitions.iter_mut().find(|p| p.name == parsed.name) {
            existing.nodes += parsed.nodes;
            existing.cpus_total += parsed.cpus_total;
            existing.cpus_idle += parsed.cpus_idle;
            existing.memory_mb = existing.memory_mb.max(parsed.memory_mb);
            existing.is_default |= parsed.is_default;
            if existing.gres.is_none() {
                existing.gres = parsed.gres;
            }
        } else {
            partitions.push(parsed);
        }
    }
    partitions
}

/// Parse a Slurm time limit into hours. `None` for `infinite`/`UNLIMITED` or
/// unparsable input.
///
/// Accepted forms: `minutes`, `minutes:seconds`, `hours:minutes:seconds`,
/// `days-hours`, `days-hours:minutes`, `days-hours:minutes:seconds`.
pub fn parse_time_limit(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.eq_ignore_ascii_case("infinite")
        || raw.eq_ignore_ascii_case("unlimited")
    {
        return None;
    }

    let (days, rest) = match raw.split_once('-') {
        Some((d, rest)) => (d.parse::<f64>().ok()?, Some(rest)),
        None => (0.0, None),
    };
    let nums = |s: &str| -> Option<Vec<f64>> {
        s.split(':').map(|p| p.parse::<f64>().ok()).collect()
    };

    let seconds = match rest {
        Some(rest) => {
            let parts = nums(rest)?;
            let h = parts.first().copied().unwrap_or(0.0);
            let m = parts.get(1).copied().unwrap_or(0.0);
            let s = parts.get(2).copied().unwrap_or(0.0);
            days * 86_400.0 + h * 3600.0 + m * 60.0 + s
        }
        None => match nums(raw)?.as_slice() {
            [m] => m * 60.0,
            [m, s] => m * 60.0 + s,
            [h, m, s] => h * 3600.0 + m * 60.0 + s,
            _ => return None,
        },
    };
    Some(seconds / 3600.0)
}

/// Format hours as `HH:MM:SS` for `#SBATCH --time`, rounding up to a minute.
pub fn format_walltime(hours: f64) -> String {
    let total_minutes = (hours.max(0.0) * 60.0).ceil() as u64;
    let total_minutes = total_minutes.max(1);
    format!("{:02}:{:02}:00", total_minutes / 60, total_minutes % 60)
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetProfile {
    pub name: String,
    pub label: String,
    pub cpus: u32,
    pub memory_gb: u32,
    pub time_hours: f64,
    pub gpu: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPresets {
    pub partition: String,
    pub max_memory_gb: u32,
    pub max_cpus: u32,
    pub max_time_hours: f64,
    pub has_gpu: bool,
    pub profiles: Vec<PresetProfile>,
}

/// Small / medium / large / max profiles bounded by the partition's limits.
pub fn partition_presets(partition: &Partition) -> PartitionPresets {
    let max_cpus = if partition.cpus_total > 0 { partition.cpus_total } else { 64 };
    let max_mem = if partition.memory_mb > 0 { partition.memory_gb().max(1) } else { 128 };
    let max_hours = partition.max_time_hours();
    let gpu = partition.has_gpu();

    let preset = |name: &str, label: &str, cpus: u32, mem: u32, hours: f64, gpu: bool| PresetProfile {
        name: name.to_string(),
        label: label.to_string(),
        cpus: cpus.min(max_cpus),
        memory_gb: mem.min(max_mem),
        time_hours: hours.min(max_hours),
        gpu,
    };

    PartitionPresets {
        partition: partition.name.clone(),
        max_memory_gb: max_mem,
        max_cpus,
        max_time_hours: max_hours,
        has_gpu: gpu,
        profiles: vec![
            preset("small", "Small (quick test)", 4, 8, 2.0, false),
            preset("medium", "Medium (standard job)", 8, 32, 8.0, gpu),
            preset("large", "Large (production run)", 16, 64, 24.0, gpu),
            preset("max", "Maximum (full partition)", max_cpus, max_mem, max_hours, gpu),
        ],
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub name: String,
    pub state: String,
    pub elapsed: String,
    pub partition: String,
    pub time_limit: String,
    pub nodes: u32,
    pub reason: String,
}

/// Parse `squeue -h -o "%i|%j|%T|%M|%P|%l|%D|%R"`.
pub fn parse_squeue(output: &str) -> Vec<QueueEntry> {
    output
        .lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.trim().splitn(8, '|').collect();
            if f.len() < 8 || f[0].is_empty() {
                return None;
            }
            Some(QueueEntry {
                job_id: f[0].to_string(),
                name: f[1].to_string(),
                state: f[2].to_string(),
                elapsed: f[3].to_string(),
                partition: f[4].to_string(),
                time_limit: f[5].to_string(),
                nodes: f[6].parse().unwrap_or(0),
                reason: f[7].to_string(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// One account association of the connected user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAssociation {
    pub account: String,
    /// `None` when the association covers every partition.
    pub partition: Option<String>,
    pub qos: Vec<String>,
    pub default_qos: Option<String>,
}

/// Parse `sacctmgr -nP show assoc user=U format=Account,Partition,QOS,DefaultQOS`.
pub fn parse_associations(output: &str) -> Vec<AccountAssociation> {
    let non_empty = |s: &str| Some(s.trim()).filter(|s| !s.is_empty()).map(str::to_string);
    output
        .lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.trim().splitn(4, '|').collect();
            let field = |i: usize| f.get(i).copied().and_then(non_empty);
            Some(AccountAssociation {
                account: field(0)?,
                partition: field(1),
                qos: f
                    .get(2)
                    .map(|q| q.split(',').filter_map(non_empty).collect())
                    .unwrap_or_default(),
                default_qos: field(3),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// State mapping
// ---------------------------------------------------------------------------

/// Map a scheduler state onto an observation.
///
/// `exit_code` comes from accounting when available; failure states without
/// one report exit code 1.
pub fn map_scheduler_state(raw: &str, exit_code: Option<i32>) -> ObservedState {
    let state = raw.trim().to_ascii_uppercase();
    // sacct may print `CANCELLED by 1234`; squeue may add a `+` suffix.
    let base = state
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('+');

    match base {
        "PENDING" | "REQUEUED" | "RESIZING" => ObservedState::Pending,
        "RUNNING" | "COMPLETING" | "CONFIGURING" | "SUSPENDED" | "STAGE_OUT" => {
            ObservedState::Running
        }
        "COMPLETED" => ObservedState::Exited { exit_code: 0 },
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" => ObservedState::Exited {
            exit_code: exit_code.filter(|c| *c != 0).unwrap_or(1),
        },
        "CANCELLED" => ObservedState::Cancelled,
        _ => ObservedState::Unknown { raw: raw.trim().to_string() },
    }
}

/// Parse `sacct -j ID -n -X -P -o State,ExitCode` into `(state, exit code)`.
///
/// ExitCode is `code:signal`; a non-zero signal without a code counts as 128 +
/// signal.
pub fn parse_sacct(output: &str) -> Option<(String, Option<i32>)> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (state, exit) = line.split_once('|').unwrap_or((line, ""));
    let exit_code = exit.split_once(':').and_then(|(code, signal)| {
        let code: i32 = code.trim().parse().ok()?;
        let signal: i32 = signal.trim().parse().unwrap_or(0);
        Some(if code == 0 && signal != 0 { 128 + signal } else { code })
    });
    Some((state.trim().to_string(), exit_code))
}

/// Extract the scheduler id from `sbatch` output.
pub fn parse_sbatch_job_id(output: &str) -> Option<String> {
    output
        .split("Submitted batch job")
        .nth(1)?
        .split_whitespace()
        .next()
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}
