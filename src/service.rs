//! Service supervision descriptors.
//!
//! A recipe may declare a long-running service. At install time the
//! descriptor is rendered - placeholders expanded, relative paths resolved
//! against the payload - to `<prefix>/services/<name>.service.json`, where a
//! supervisor (or the operator) can pick it up. Uninstall removes it.

use crate::error::Result;
use crate::executor::BuildEnv;
use crate::recipe::Recipe;
use crate::store::Store;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A rendered, ready-to-run service descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub pkg_version: String,
    /// Absolute argv of the supervised process
    pub run: Vec<String>,
    pub keep_alive: bool,
    #[serde(default)]
    pub log: Option<PathBuf>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Descriptor file path for a recipe.
pub fn descriptor_path(store: &Store, name: &str) -> PathBuf {
    store.services_dir().join(format!("{name}.service.json"))
}

/// Render a recipe's service descriptor into the prefix.
///
/// Returns `None` when the recipe declares no service. The run command's
/// program is resolved against the payload directory so the descriptor
/// points at the versioned binary.
pub fn render(
    store: &Store,
    recipe: &Recipe,
    keg: &Path,
    env: &BuildEnv,
) -> Result<Option<PathBuf>> {
    let Some(service) = &recipe.service else {
        return Ok(None);
    };

    let mut run: Vec<String> = service.run.iter().map(|arg| env.expand(arg)).collect();
    if let Some(program) = run.first_mut() {
        let path = Path::new(program);
        if path.is_relative() {
            *program = keg.join(path).display().to_string();
        }
    }

    let resolve = |value: &String| {
        let expanded = env.expand(value);
        let path = PathBuf::from(&expanded);
        if path.is_relative() {
            store.prefix().join(path)
        } else {
            path
        }
    };

    let descriptor = ServiceDescriptor {
        name: recipe.name.clone(),
        pkg_version: recipe.pkg_version(),
        run,
        keep_alive: service.keep_alive,
        log: service.log.as_ref().map(resolve),
        working_dir: service.working_dir.as_ref().map(resolve),
    };

    let services_dir = store.services_dir();
    fs::create_dir_all(&services_dir).with_context(|| {
        format!("Failed to create services dir: {}", services_dir.display())
    })?;

    let path = descriptor_path(store, &recipe.name);
    let json = serde_json::to_string_pretty(&descriptor)?;
    fs::write(&path, json)
        .with_context(|| format!("Failed to write descriptor: {}", path.display()))?;

    Ok(Some(path))
}

/// Remove a recipe's descriptor if present.
pub fn remove(store: &Store, name: &str) -> Result<()> {
    let path = descriptor_path(store, name);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove descriptor: {}", path.display()))?;
    }
    Ok(())
}

/// All rendered descriptors under the prefix, sorted by name.
pub fn list(store: &Store) -> Result<Vec<ServiceDescriptor>> {
    let services_dir = store.services_dir();
    let mut descriptors = Vec::new();

    if !services_dir.exists() {
        return Ok(descriptors);
    }

    for entry in fs::read_dir(&services_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path
            .file_name()
            .and_then(|f| f.to_str())
            .is_some_and(|f| f.ends_with(".service.json"))
        {
            let contents = fs::read_to_string(&path)?;
            descriptors.push(serde_json::from_str(&contents)?);
        }
    }

    descriptors.sort_by(|a: &ServiceDescriptor, b: &ServiceDescriptor| a.name.cmp(&b.name));
    Ok(descriptors)
}
