//! Installed-file manifests.
//!
//! Each store payload carries a `MANIFEST.json` recording what the recipe
//! installation owns: the prefix-relative paths it linked, its runtime
//! dependency closure, and install metadata. The manifest is what makes
//! clean removal and upgrade possible.

use crate::recipe::Recipe;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "MANIFEST.json";

/// One resolved runtime dependency at install time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeDependency {
    pub name: String,
    pub pkg_version: String,
    /// Declared on the recipe itself, as opposed to pulled in transitively
    #[serde(default)]
    pub declared_directly: bool,
}

/// Record of the files a recipe installation owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledManifest {
    pub mash_version: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    pub pkg_version: String,
    #[serde(default)]
    pub license: Option<String>,
    pub installed_on_request: bool,
    pub installed_as_dependency: bool,
    /// Unix epoch seconds
    pub time: i64,
    /// Prefix-relative paths this installation linked into the prefix.
    /// Empty for unlinked ("keg-only") recipes.
    #[serde(default)]
    pub linked_files: Vec<PathBuf>,
    #[serde(default)]
    pub runtime_dependencies: Vec<RuntimeDependency>,
}

impl InstalledManifest {
    pub fn new(
        recipe: &Recipe,
        linked_files: Vec<PathBuf>,
        runtime_dependencies: Vec<RuntimeDependency>,
        installed_on_request: bool,
    ) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Self {
            mash_version: format!("mash/{}", env!("CARGO_PKG_VERSION")),
            name: recipe.name.clone(),
            version: recipe.version.clone(),
            revision: recipe.revision,
            pkg_version: recipe.pkg_version(),
            license: recipe.license.clone(),
            installed_on_request,
            installed_as_dependency: !installed_on_request,
            time: now,
            linked_files,
            runtime_dependencies,
        }
    }

    /// Read the manifest from a store payload directory.
    pub fn read(keg: &Path) -> Result<Self> {
        let path = keg.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let manifest: Self =
            serde_json::from_str(&contents).context("Failed to parse MANIFEST.json")?;
        Ok(manifest)
    }

    /// Write the manifest beside the payload.
    pub fn write(&self, keg: &Path) -> Result<()> {
        let path = keg.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize manifest")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_recipe() -> Recipe {
        toml::from_str(
            r#"
            name = "hello"
            version = "2.12"
            revision = 1
            license = "GPL-3.0-or-later"

            [source]
            url = "https://example.org/hello-2.12.tar.gz"
            sha256 = "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = sample_recipe();
        let manifest = InstalledManifest::new(
            &recipe,
            vec![PathBuf::from("bin/hello")],
            vec![RuntimeDependency {
                name: "gettext".to_string(),
                pkg_version: "0.22".to_string(),
                declared_directly: true,
            }],
            true,
        );

        manifest.write(dir.path()).unwrap();
        let loaded = InstalledManifest::read(dir.path()).unwrap();

        assert_eq!(loaded.name, "hello");
        assert_eq!(loaded.pkg_version, "2.12_1");
        assert_eq!(loaded.linked_files, vec![PathBuf::from("bin/hello")]);
        assert_eq!(loaded.runtime_dependencies.len(), 1);
        assert!(loaded.installed_on_request);
        assert!(!loaded.installed_as_dependency);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InstalledManifest::read(dir.path()).is_err());
    }
}
