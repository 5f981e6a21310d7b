//! Install prefix layout and the versioned store.
//!
//! Every build output lands under one prefix:
//!
//! ```text
//! <prefix>/
//!   store/<name>/<pkg_version>/   # versioned payload ("keg") per recipe
//!   bin/ lib/ ...                 # symlinks into the store
//!   services/                     # rendered service descriptors
//!   registry.json                 # installed-recipe registry
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Detect the install prefix: `MASH_PREFIX` wins, then `~/.mash`.
pub fn detect_prefix() -> PathBuf {
    if let Ok(prefix) = std::env::var("MASH_PREFIX") {
        return PathBuf::from(prefix);
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".mash");
    }

    PathBuf::from("/usr/local/mash")
}

/// Handle on one install prefix.
#[derive(Debug, Clone)]
pub struct Store {
    prefix: PathBuf,
}

impl Store {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Store rooted at the detected system prefix.
    pub fn detect() -> Self {
        Self::new(detect_prefix())
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Root of the versioned store.
    pub fn store_dir(&self) -> PathBuf {
        self.prefix.join("store")
    }

    /// Versioned payload directory for one recipe build.
    pub fn keg(&self, name: &str, pkg_version: &str) -> PathBuf {
        self.store_dir().join(name).join(pkg_version)
    }

    /// Scratch build directory for one recipe build. Wiped before reuse so
    /// stale generated files never leak into a rebuild.
    pub fn build_dir(&self, name: &str, pkg_version: &str) -> PathBuf {
        self.prefix
            .join("var/build")
            .join(format!("{name}-{pkg_version}"))
    }

    /// Where rendered service descriptors live.
    pub fn services_dir(&self) -> PathBuf {
        self.prefix.join("services")
    }

    /// The persisted installed-recipe registry.
    pub fn registry_path(&self) -> PathBuf {
        self.prefix.join("registry.json")
    }

    /// All store versions present for a recipe, newest first.
    pub fn installed_versions(&self, name: &str) -> Result<Vec<String>> {
        let recipe_dir = self.store_dir().join(name);

        if !recipe_dir.exists() {
            return Ok(vec![]);
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&recipe_dir)
            .with_context(|| format!("Failed to read store: {}", recipe_dir.display()))?
        {
            let entry = entry?;
            let version = entry.file_name().to_string_lossy().to_string();
            if version.starts_with('.') {
                continue;
            }
            versions.push(version);
        }

        versions.sort_by(|a, b| compare_versions(a, b));
        versions.reverse();
        Ok(versions)
    }

    /// Names of all recipes with at least one store entry.
    pub fn installed_names(&self) -> Result<Vec<String>> {
        let store = self.store_dir();

        if !store.exists() {
            return Ok(vec![]);
        }

        let mut names = Vec::new();
        for entry in
            fs::read_dir(&store).with_context(|| format!("Failed to read store: {}", store.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }
}

/// Compare two version strings numerically per dot-separated component,
/// lexicographic fallback.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let a_parts: Vec<u32> = a
        .split(['.', '_'])
        .filter_map(|s| s.parse::<u32>().ok())
        .collect();
    let b_parts: Vec<u32> = b
        .split(['.', '_'])
        .filter_map(|s| s.parse::<u32>().ok())
        .collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }

    a.cmp(b)
}
