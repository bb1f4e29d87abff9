//! Registry lockfile: pins each definition to a version and content digest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub version: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    #[serde(default)]
    pub plugins: BTreeMap<String, LockEntry>,
    #[serde(default)]
    pub workflows: BTreeMap<String, LockEntry>,
}

/// Differences between a stored lockfile and the loaded definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReport {
    /// Present in both, but version or digest differs.
    pub changed: Vec<String>,
    /// Pinned in the lockfile but no longer loaded.
    pub missing: Vec<String>,
    /// Loaded but not pinned.
    pub added: Vec<String>,
}

impl LockReport {
    pub fn is_clean(&self) -> bool {
        self.changed.is_empty() && self.missing.is_empty() && self.added.is_empty()
    }
}

impl Lockfile {
    /// Compare `pinned` against `self` (the current state).
    pub fn verify(&self, pinned: &Lockfile) -> LockReport {
        let mut report = LockReport::default();
        diff_section("plugin", &self.plugins, &pinned.plugins, &mut report);
        diff_section("workflow", &self.workflows, &pinned.workflows, &mut report);
        report
    }
}

fn diff_section(
    kind: &str,
    current: &BTreeMap<String, LockEntry>,
    pinned: &BTreeMap<String, LockEntry>,
    report: &mut LockReport,
) {
    for (id, entry) in pinned {
        match current.get(id) {
            Some(now) if now != entry => report.changed.push(format!("{kind}:{id}")),
            Some(_) => {}
            None => report.missing.push(format!("{kind}:{id}")),
        }
    }
    for id in current.keys() {
        if !pinned.contains_key(id) {
            report.added.push(format!("{kind}:{id}"));
        }
    }
}
