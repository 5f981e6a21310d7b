//! The persisted installed-recipe registry.
//!
//! `<prefix>/registry.json` maps recipe name to its installed version and
//! linked files. It is read at startup and rewritten after each successful
//! install or uninstall - never mid-pipeline, so a failed build can't corrupt
//! the record of a working install. A derived path index backs install
//! conflict detection.

use crate::error::{MashError, Result};
use crate::manifest::InstalledManifest;
use crate::store::Store;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// One installed recipe as recorded on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub pkg_version: String,
    pub installed_on_request: bool,
    /// Prefix-relative paths owned by this installation
    #[serde(default)]
    pub linked_files: Vec<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    installed: BTreeMap<String, RegistryEntry>,
}

/// In-memory registry with a path ownership index.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    installed: BTreeMap<String, RegistryEntry>,
    /// prefix-relative path -> owning recipe name
    owners: HashMap<PathBuf, String>,
}

impl Registry {
    /// Load the registry for a prefix; a missing file is an empty registry.
    pub fn load(store: &Store) -> Result<Self> {
        let path = store.registry_path();
        let installed = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read registry: {}", path.display()))?;
            let file: RegistryFile =
                serde_json::from_str(&contents).context("Failed to parse registry.json")?;
            file.installed
        } else {
            BTreeMap::new()
        };

        let mut owners = HashMap::new();
        for (name, entry) in &installed {
            for file in &entry.linked_files {
                owners.insert(file.clone(), name.clone());
            }
        }

        Ok(Self {
            path,
            installed,
            owners,
        })
    }

    /// Rewrite the registry on disk. Write-then-rename so a crash can't
    /// leave a half-written file behind.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = RegistryFile {
            installed: self.installed.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize registry")?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write registry: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace registry: {}", self.path.display()))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.installed.get(name)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.installed.iter()
    }

    /// Who owns a prefix-relative path, if anyone.
    pub fn owner_of(&self, path: &Path) -> Option<&str> {
        self.owners.get(path).map(String::as_str)
    }

    /// Fail if any candidate path is already owned by a different recipe.
    ///
    /// Reinstalls of the same recipe are allowed to reclaim their own paths.
    pub fn check_conflicts(&self, name: &str, candidates: &[PathBuf]) -> Result<()> {
        for candidate in candidates {
            if let Some(owner) = self.owner_of(candidate) {
                if owner != name {
                    return Err(MashError::InstallConflict {
                        path: candidate.clone(),
                        owner: owner.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Record a completed install, replacing any previous entry for the
    /// recipe, and persist.
    pub fn record_install(&mut self, manifest: &InstalledManifest) -> Result<()> {
        self.drop_owner(&manifest.name);

        let entry = RegistryEntry {
            pkg_version: manifest.pkg_version.clone(),
            installed_on_request: manifest.installed_on_request,
            linked_files: manifest.linked_files.clone(),
        };
        for file in &entry.linked_files {
            self.owners.insert(file.clone(), manifest.name.clone());
        }
        self.installed.insert(manifest.name.clone(), entry);
        self.save()
    }

    /// Remove a recipe's entry and persist. Returns the removed entry so the
    /// caller can unlink its files.
    pub fn record_uninstall(&mut self, name: &str) -> Result<Option<RegistryEntry>> {
        self.drop_owner(name);
        let removed = self.installed.remove(name);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    fn drop_owner(&mut self, name: &str) {
        self.owners.retain(|_, owner| owner != name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::InstalledManifest;
    use crate::recipe::Recipe;

    fn sample_recipe(name: &str) -> Recipe {
        let doc = format!(
            r#"
            name = "{name}"
            version = "1.0"

            [source]
            url = "https://example.org/{name}.tar.gz"
            sha256 = "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"
            "#
        );
        toml::from_str(&doc).unwrap()
    }

    fn manifest_for(name: &str, files: &[&str]) -> InstalledManifest {
        InstalledManifest::new(
            &sample_recipe(name),
            files.iter().map(PathBuf::from).collect(),
            vec![],
            true,
        )
    }

    #[test]
    fn persists_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut registry = Registry::load(&store).unwrap();
        registry
            .record_install(&manifest_for("hello", &["bin/hello"]))
            .unwrap();

        let reloaded = Registry::load(&store).unwrap();
        assert!(reloaded.is_installed("hello"));
        assert_eq!(reloaded.owner_of(Path::new("bin/hello")), Some("hello"));
        assert_eq!(reloaded.get("hello").unwrap().pkg_version, "1.0");
    }

    #[test]
    fn conflicting_path_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut registry = Registry::load(&store).unwrap();
        registry
            .record_install(&manifest_for("first", &["bin/tool"]))
            .unwrap();

        let candidates = vec![PathBuf::from("bin/tool")];
        match registry.check_conflicts("second", &candidates) {
            Err(MashError::InstallConflict { path, owner }) => {
                assert_eq!(path, PathBuf::from("bin/tool"));
                assert_eq!(owner, "first");
            }
            other => panic!("expected InstallConflict, got {other:?}"),
        }

        // same recipe may reclaim its own paths
        registry.check_conflicts("first", &candidates).unwrap();
    }

    #[test]
    fn uninstall_releases_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut registry = Registry::load(&store).unwrap();
        registry
            .record_install(&manifest_for("hello", &["bin/hello"]))
            .unwrap();

        let removed = registry.record_uninstall("hello").unwrap().unwrap();
        assert_eq!(removed.linked_files, vec![PathBuf::from("bin/hello")]);
        assert!(!registry.is_installed("hello"));
        assert_eq!(registry.owner_of(Path::new("bin/hello")), None);

        let reloaded = Registry::load(&store).unwrap();
        assert!(!reloaded.is_installed("hello"));
    }

    #[test]
    fn reinstall_replaces_previous_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut registry = Registry::load(&store).unwrap();
        registry
            .record_install(&manifest_for("hello", &["bin/hello", "share/doc"]))
            .unwrap();
        registry
            .record_install(&manifest_for("hello", &["bin/hello"]))
            .unwrap();

        assert_eq!(registry.owner_of(Path::new("share/doc")), None);
        assert_eq!(registry.owner_of(Path::new("bin/hello")), Some("hello"));
    }
}
