//! Remote host inspection: system info and directory listings.

use neuroinsight_core::outputs::is_volumetric;
use serde::Serialize;

use crate::session::RemoteEntry;

/// One probe per line, `key=value`, so a single round trip answers everything.
pub const SYSTEM_INFO_SCRIPT: &str = concat!(
    "echo \"os=$(grep '^PRETTY_NAME=' /etc/os-release 2>/dev/null | cut -d= -f2- | tr -d '\\\"')\"; ",
    "echo \"cpu_model=$(lscpu 2>/dev/null | sed -n 's/^Model name:[[:space:]]*//p' | head -1)\"; ",
    "echo \"cpu_count=$(nproc 2>/dev/null)\"; ",
    "echo \"memory_gb=$(free -g 2>/dev/null | awk '/^Mem:/{print $2}')\"; ",
    "echo \"gpus=$(nvidia-smi --query-gpu=name --format=csv,noheader 2>/dev/null | paste -sd ';' -)\"; ",
    "echo \"docker=$(docker --version 2>/dev/null)\"; ",
    "echo \"hostname=$(hostname 2>/dev/null)\""
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub host: String,
    pub user: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_count: u32,
    pub memory_gb: u32,
    pub gpu_count: u32,
    pub gpus: Vec<String>,
    pub docker_version: Option<String>,
}

/// Parse the output of [`SYSTEM_INFO_SCRIPT`]. Missing probes stay empty.
pub fn parse_system_info(host: &str, user: &str, output: &str) -> SystemInfo {
    let mut info = SystemInfo {
        host: host.to_string(),
        user: user.to_string(),
        ..Default::default()
    };
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let text = (!value.is_empty()).then(|| value.to_string());
        match key.trim() {
            "os" => info.os = text,
            "cpu_model" => info.cpu_model = text,
            "cpu_count" => info.cpu_count = value.parse().unwrap_or(0),
            "memory_gb" => info.memory_gb = value.parse().unwrap_or(0),
            "gpus" => {
                info.gpus = value
                    .split(';')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect();
                info.gpu_count = u32::try_from(info.gpus.len()).unwrap_or(u32::MAX);
            }
            "docker" => info.docker_version = text,
            "hostname" => info.hostname = text,
            _ => {}
        }
    }
    info
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowseEntry {
    #[serde(flatten)]
    pub entry: RemoteEntry,
    /// Recognised volumetric image (`.nii`, `.nii.gz`, `.mgz`, `.mgh`).
    pub is_volumetric: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub path: String,
    pub parent: Option<String>,
    pub entries: Vec<BrowseEntry>,
}

/// Directories first, then files, each group by case-insensitive name.
/// Hidden entries are dropped.
pub fn build_listing(path: &str, entries: Vec<RemoteEntry>) -> DirectoryListing {
    let mut entries: Vec<BrowseEntry> = entries
        .into_iter()
        .filter(|e| !e.name.starts_with('.'))
        .map(|entry| BrowseEntry {
            is_volumetric: !entry.is_dir && is_volumetric(&entry.name),
            entry,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.entry
            .is_dir
            .cmp(&a.entry.is_dir)
            .then_with(|| a.entry.name.to_lowercase().cmp(&b.entry.name.to_lowercase()))
    });
    DirectoryListing {
        path: path.to_string(),
        parent: parent_of(path),
        entries,
    }
}

fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_dir: bool) -> RemoteEntry {
        RemoteEntry {
            name: name.into(),
            path: format!("/data/{name}"),
            is_dir,
            size_bytes: 10,
            modified: None,
        }
    }

    #[test]
    fn system_info_parses_probes() {
        let out = "os=Rocky Linux 9.3\ncpu_model=AMD EPYC 7763\ncpu_count=128\nmemory_gb=503\n\
                   gpus=NVIDIA A100;NVIDIA A100\ndocker=Docker version 24.0.7\nhostname=login01\n";
        let info = parse_system_info("hpc.example.org", "alice", out);
        assert_eq!(info.os.as_deref(), Some("Rocky Linux 9.3"));
        assert_eq!(info.cpu_count, 128);
        assert_eq!(info.memory_gb, 503);
        assert_eq!(info.gpu_count, 2);
        assert_eq!(info.hostname.as_deref(), Some("login01"));
    }

    #[test]
    fn system_info_tolerates_missing_tools() {
        let info = parse_system_info("h", "u", "os=\ncpu_count=\ngpus=\ndocker=\n");
        assert_eq!(info.os, None);
        assert_eq!(info.cpu_count, 0);
        assert_eq!(info.gpu_count, 0);
        assert_eq!(info.docker_version, None);
    }

    #[test]
    fn listing_sorts_dirs_first_and_flags_volumes() {
        let listing = build_listing(
            "/data",
            vec![
                entry("sub-02_T1w.nii.gz", false),
                entry("notes.txt", false),
                entry(".cache", true),
                entry("derivatives", true),
                entry("Anat", true),
            ],
        );
        let names: Vec<&str> = listing.entries.iter().map(|e| e.entry.name.as_str()).collect();
        assert_eq!(names, vec!["Anat", "derivatives", "notes.txt", "sub-02_T1w.nii.gz"]);
        assert!(listing.entries[3].is_volumetric);
        assert!(!listing.entries[2].is_volumetric);
        assert_eq!(listing.parent.as_deref(), Some("/"));
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/scratch/alice/"), Some("/scratch".to_string()));
    }
}
