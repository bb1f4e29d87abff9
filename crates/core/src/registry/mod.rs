//! Plugin/workflow registry.
//!
//! Definitions are read eagerly from two directories of YAML files. A file
//! that fails to parse or validate is reported in [`Registry::rejected`] and
//! excluded; loading itself never fails.

pub mod lock;
pub mod plugin;
pub mod workflow;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::error::CoreError;
use crate::hashing::sha256_hex;

pub use lock::{LockEntry, LockReport, Lockfile};
pub use plugin::PluginDefinition;
pub use workflow::WorkflowDefinition;

/// A definition file excluded at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Source {
    version: String,
    sha256: String,
}

/// Immutable snapshot of every loaded definition.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    plugins: BTreeMap<String, PluginDefinition>,
    workflows: BTreeMap<String, WorkflowDefinition>,
    plugin_sources: BTreeMap<String, Source>,
    workflow_sources: BTreeMap<String, Source>,
    rejected: Vec<Rejected>,
}

impl Registry {
    /// Load every `*.yaml` / `*.yml` file from both directories.
    pub fn load(plugins_dir: &Path, workflows_dir: &Path) -> Self {
        let mut registry = Registry::default();

        for (path, text) in read_definitions(plugins_dir, &mut registry.rejected) {
            match serde_yaml::from_str::<PluginDefinition>(&text) {
                Ok(def) => {
                    let sha = sha256_hex(text.as_bytes());
                    registry.add_plugin(def, &path, sha);
                }
                Err(e) => registry.reject(&path, format!("invalid plugin YAML: {e}")),
            }
        }

        for (path, text) in read_definitions(workflows_dir, &mut registry.rejected) {
            match serde_yaml::from_str::<WorkflowDefinition>(&text) {
                Ok(def) => {
                    let sha = sha256_hex(text.as_bytes());
                    registry.add_workflow(def, &path, sha);
                }
                Err(e) => registry.reject(&path, format!("invalid workflow YAML: {e}")),
            }
        }

        tracing::info!(
            plugins = registry.plugins.len(),
            workflows = registry.workflows.len(),
            rejected = registry.rejected.len(),
            "Definition registry loaded"
        );
        registry
    }

    /// Build from already-parsed definitions, applying the same validation
    /// as [`Registry::load`]. Digests are computed over the YAML rendering.
    pub fn from_definitions(
        plugins: Vec<PluginDefinition>,
        workflows: Vec<WorkflowDefinition>,
    ) -> Self {
        let mut registry = Registry::default();
        for def in plugins {
            let sha = sha256_hex(serde_yaml::to_string(&def).unwrap_or_default().as_bytes());
            let label = format!("<plugin:{}>", def.id);
            registry.add_plugin(def, &label, sha);
        }
        for def in workflows {
            let sha = sha256_hex(serde_yaml::to_string(&def).unwrap_or_default().as_bytes());
            let label = format!("<workflow:{}>", def.id);
            registry.add_workflow(def, &label, sha);
        }
        registry
    }

    fn reject(&mut self, path: &str, reason: String) {
        tracing::warn!(path, reason = %reason, "Definition rejected");
        self.rejected.push(Rejected {
            path: path.to_string(),
            reason,
        });
    }

    fn add_plugin(&mut self, def: PluginDefinition, path: &str, sha256: String) {
        if let Err(errors) = def.validate() {
            return self.reject(path, errors.join("; "));
        }
        if self.plugins.contains_key(&def.id) {
            return self.reject(path, format!("duplicate plugin id '{}'", def.id));
        }
        self.plugin_sources.insert(
            def.id.clone(),
            Source {
                version: def.version.clone(),
                sha256,
            },
        );
        self.plugins.insert(def.id.clone(), def);
    }

    fn add_workflow(&mut self, def: WorkflowDefinition, path: &str, sha256: String) {
        if let Err(errors) = def.validate() {
            return self.reject(path, errors.join("; "));
        }
        if self.workflows.contains_key(&def.id) {
            return self.reject(path, format!("duplicate workflow id '{}'", def.id));
        }
        if let Some(step) = def.steps.iter().find(|s| !self.plugins.contains_key(&s.uses)) {
            return self.reject(
                path,
                format!("step '{}' references unknown plugin '{}'", step.id, step.uses),
            );
        }
        let image_conflict = {
            let mut images = def
                .plugin_ids()
                .filter_map(|id| self.plugins.get(id))
                .map(|p| p.container.image.as_str());
            images.next().and_then(|first| {
                images.find(|img| *img != first).map(|other| {
                    format!("steps use different container images ('{first}', '{other}')")
                })
            })
        };
        if let Some(reason) = image_conflict {
            return self.reject(path, reason);
        }
        self.workflow_sources.insert(
            def.id.clone(),
            Source {
                version: def.version.clone(),
                sha256,
            },
        );
        self.workflows.insert(def.id.clone(), def);
    }

    // -- queries --

    /// Plugins sorted by id. Hidden plugins are skipped when
    /// `user_selectable_only` is set but stay resolvable through `get_plugin`.
    pub fn list_plugins(&self, user_selectable_only: bool) -> Vec<&PluginDefinition> {
        self.plugins
            .values()
            .filter(|p| !user_selectable_only || p.user_selectable())
            .collect()
    }

    pub fn get_plugin(&self, id: &str) -> Result<&PluginDefinition, CoreError> {
        self.plugins.get(id).ok_or_else(|| CoreError::not_found("Plugin", id))
    }

    pub fn list_workflows(&self, user_selectable_only: bool) -> Vec<&WorkflowDefinition> {
        self.workflows
            .values()
            .filter(|w| !user_selectable_only || w.user_selectable())
            .collect()
    }

    pub fn get_workflow(&self, id: &str) -> Result<&WorkflowDefinition, CoreError> {
        self.workflows.get(id).ok_or_else(|| CoreError::not_found("Workflow", id))
    }

    pub fn rejected(&self) -> &[Rejected] {
        &self.rejected
    }

    pub fn lockfile(&self) -> Lockfile {
        let entries = |sources: &BTreeMap<String, Source>| {
            sources
                .iter()
                .map(|(id, s)| {
                    (
                        id.clone(),
                        LockEntry {
                            version: s.version.clone(),
                            sha256: s.sha256.clone(),
                        },
                    )
                })
                .collect()
        };
        Lockfile {
            plugins: entries(&self.plugin_sources),
            workflows: entries(&self.workflow_sources),
        }
    }

    pub fn verify_lock(&self, pinned: &Lockfile) -> LockReport {
        self.lockfile().verify(pinned)
    }
}

/// Sorted `(path, contents)` of every YAML file in `dir`.
fn read_definitions(dir: &Path, rejected: &mut Vec<Rejected>) -> Vec<(String, String)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Definition directory not readable");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    paths.sort();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let display = path.display().to_string();
        match std::fs::read_to_string(&path) {
            Ok(text) => out.push((display, text)),
            Err(e) => rejected.push(Rejected {
                path: display,
                reason: format!("unreadable: {e}"),
            }),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Process-wide registry with atomic snapshot replacement on reload.
#[derive(Debug)]
pub struct RegistryHandle {
    current: RwLock<Arc<Registry>>,
    plugins_dir: PathBuf,
    workflows_dir: PathBuf,
}

impl RegistryHandle {
    pub fn load(plugins_dir: impl Into<PathBuf>, workflows_dir: impl Into<PathBuf>) -> Self {
        let plugins_dir = plugins_dir.into();
        let workflows_dir = workflows_dir.into();
        let registry = Registry::load(&plugins_dir, &workflows_dir);
        Self {
            current: RwLock::new(Arc::new(registry)),
            plugins_dir,
            workflows_dir,
        }
    }

    /// Wrap a prepared registry; `reload` will read the given directories.
    pub fn with_registry(
        registry: Registry,
        plugins_dir: impl Into<PathBuf>,
        workflows_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
            plugins_dir: plugins_dir.into(),
            workflows_dir: workflows_dir.into(),
        }
    }

    pub fn snapshot(&self) -> Arc<Registry> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read both directories and swap the snapshot in one step.
    pub fn reload(&self) -> Arc<Registry> {
        let fresh = Arc::new(Registry::load(&self.plugins_dir, &self.workflows_dir));
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::clone(&fresh);
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    use plugin::tests::FASTSURFER_YAML;
    use workflow::tests::STRUCTURAL_YAML;

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    fn dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let plugins = root.path().join("plugins");
        let workflows = root.path().join("workflows");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::create_dir_all(&workflows).unwrap();
        (root, plugins, workflows)
    }

    #[test]
    fn loads_valid_and_reports_malformed_definitions() {
        let (_root, plugins, workflows) = dirs();
        write(&plugins, "fastsurfer.yaml", FASTSURFER_YAML);
        write(&plugins, "broken.yml", "id: [unterminated");
        write(&plugins, "notes.txt", "ignored");
        write(&workflows, "structural.yaml", STRUCTURAL_YAML);

        let reg = Registry::load(&plugins, &workflows);
        assert_eq!(reg.list_plugins(false).len(), 1);
        assert_eq!(reg.list_workflows(false).len(), 1);
        assert_eq!(reg.rejected().len(), 1);
        assert!(reg.rejected()[0].path.ends_with("broken.yml"));
    }

    #[test]
    fn missing_directories_give_an_empty_registry() {
        let root = tempfile::tempdir().unwrap();
        let reg = Registry::load(&root.path().join("nope"), &root.path().join("nada"));
        assert!(reg.list_plugins(false).is_empty());
        assert!(reg.rejected().is_empty());
    }

    #[test]
    fn duplicate_ids_keep_the_first_file() {
        let (_root, plugins, workflows) = dirs();
        write(&plugins, "a.yaml", FASTSURFER_YAML);
        write(&plugins, "b.yaml", &FASTSURFER_YAML.replace("name: FastSurfer", "name: Copy"));
        let reg = Registry::load(&plugins, &workflows);
        assert_eq!(reg.get_plugin("fastsurfer").unwrap().name, "FastSurfer");
        assert!(reg.rejected()[0].reason.contains("duplicate"));
    }

    #[test]
    fn workflow_with_unknown_plugin_is_rejected_at_load() {
        let (_root, plugins, workflows) = dirs();
        write(&workflows, "structural.yaml", STRUCTURAL_YAML);
        let reg = Registry::load(&plugins, &workflows);
        assert_matches!(reg.get_workflow("structural_segmentation"), Err(CoreError::NotFound { .. }));
        assert!(reg.rejected()[0].reason.contains("unknown plugin 'fastsurfer'"));
    }

    #[test]
    fn hidden_plugins_are_listed_only_when_asked() {
        let mut hidden = plugin::tests::fastsurfer();
        hidden.id = "fastsurfer_seg".into();
        hidden.visibility.user_selectable = false;
        let reg = Registry::from_definitions(vec![plugin::tests::fastsurfer(), hidden], vec![]);
        assert_eq!(reg.list_plugins(true).len(), 1);
        assert_eq!(reg.list_plugins(false).len(), 2);
        assert!(reg.get_plugin("fastsurfer_seg").is_ok());
    }

    #[test]
    fn workflow_steps_must_share_an_image() {
        let mut other = plugin::tests::fastsurfer();
        other.id = "fmriprep".into();
        other.container.image = "nipreps/fmriprep:23.2.0".into();
        let mut wf = workflow::tests::structural();
        wf.steps.push(workflow::WorkflowStep {
            id: "func".into(),
            uses: "fmriprep".into(),
            label: String::new(),
        });
        let reg = Registry::from_definitions(vec![plugin::tests::fastsurfer(), other], vec![wf]);
        assert!(reg.list_workflows(false).is_empty());
        assert!(reg.rejected()[0].reason.contains("different container images"));
    }

    #[test]
    fn lockfile_tracks_file_digests() {
        let (_root, plugins, workflows) = dirs();
        write(&plugins, "fastsurfer.yaml", FASTSURFER_YAML);
        let handle = RegistryHandle::load(&plugins, &workflows);
        let pinned = handle.snapshot().lockfile();
        assert_eq!(pinned.plugins["fastsurfer"].version, "2.2.0");
        assert_eq!(pinned.plugins["fastsurfer"].sha256, sha256_hex(FASTSURFER_YAML.as_bytes()));

        write(&plugins, "fastsurfer.yaml", &FASTSURFER_YAML.replace("Deep-MI", "DeepMI"));
        write(&workflows, "structural.yaml", STRUCTURAL_YAML);
        let reloaded = handle.reload();
        let report = reloaded.verify_lock(&pinned);
        assert_eq!(report.changed, vec!["plugin:fastsurfer".to_string()]);
        assert_eq!(report.added, vec!["workflow:structural_segmentation".to_string()]);
        assert_eq!(handle.snapshot().list_workflows(false).len(), 1);
    }
}
