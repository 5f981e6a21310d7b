//! Artifact installation: linking store payloads into the prefix and
//! rewriting staged configuration for its final location.
//!
//! The install phase stages files into the versioned store directory; the
//! installer then exposes the payload by creating relative symlinks from the
//! prefix (`bin/`, `lib/`, ...) into the store. Linked paths are recorded so
//! removal is exact, reinstalls replace their own stale links, and a path
//! owned by another recipe is a conflict, not a silent overwrite.

use crate::error::{MashError, Result};
use crate::executor::BuildEnv;
use crate::store::Store;
use anyhow::Context;
use rayon::prelude::*;
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Payload directories exposed from the store into the prefix.
pub const LINKABLE_DIRS: &[&str] = &["bin", "sbin", "lib", "include", "share", "etc"];

/// Prefix-relative paths a payload would claim when linked.
///
/// Computed before touching the prefix so conflict checks run first.
pub fn linkable_paths(keg: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for dir_name in LINKABLE_DIRS {
        let source_dir = keg.join(dir_name);
        if !source_dir.is_dir() {
            continue;
        }

        for entry in WalkDir::new(&source_dir).follow_links(false) {
            let entry = entry.map_err(|e| anyhow::anyhow!("walk failed: {e}"))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(keg)
                .expect("walk stays under keg");
            paths.push(relative.to_path_buf());
        }
    }

    paths.sort();
    Ok(paths)
}

/// Link a staged payload into the prefix with relative symlinks.
///
/// Returns the prefix-relative paths actually linked. A link left behind by
/// a previous build of the same recipe is replaced (idempotent reinstall);
/// anything else already sitting at a target path is a conflict.
pub fn link_keg(store: &Store, name: &str, keg: &Path) -> Result<Vec<PathBuf>> {
    let prefix = store.prefix();
    let recipe_store_dir = store.store_dir().join(name);
    let mut linked = Vec::new();

    for relative in linkable_paths(keg)? {
        let source = keg.join(&relative);
        let target = prefix.join(&relative);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        if target.symlink_metadata().is_ok() {
            let ours = fs::read_link(&target)
                .ok()
                .map(|existing| resolves_into(&target, &existing, &recipe_store_dir))
                .unwrap_or(false);
            if ours {
                fs::remove_file(&target)?;
            } else {
                return Err(MashError::InstallConflict {
                    path: relative,
                    owner: "unmanaged file".to_string(),
                });
            }
        }

        let link = relative_link(prefix, &source, &relative);
        unix_fs::symlink(&link, &target).with_context(|| {
            format!(
                "Failed to create symlink: {} -> {}",
                target.display(),
                link.display()
            )
        })?;
        linked.push(relative);
    }

    debug!(recipe = name, files = linked.len(), "linked payload");
    Ok(linked)
}

/// Remove a recipe's links from the prefix. Only links that still point into
/// the recipe's store subtree are touched.
pub fn unlink_keg(store: &Store, name: &str, linked_files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let prefix = store.prefix();
    let recipe_store_dir = store.store_dir().join(name);
    let mut unlinked = Vec::new();

    for relative in linked_files {
        let target = prefix.join(relative);
        if target.symlink_metadata().is_err() {
            continue;
        }
        if let Ok(existing) = fs::read_link(&target) {
            if resolves_into(&target, &existing, &recipe_store_dir) {
                fs::remove_file(&target)?;
                unlinked.push(relative.clone());
            }
        }
    }

    Ok(unlinked)
}

/// Does a symlink at `target` pointing at `link` land inside `dir`?
fn resolves_into(target: &Path, link: &Path, dir: &Path) -> bool {
    let resolved = if link.is_relative() {
        match target.parent() {
            Some(parent) => normalize(&parent.join(link)),
            None => return false,
        }
    } else {
        normalize(link)
    };
    resolved.starts_with(dir)
}

/// Lexical normalization: fold out `..` and `.` without touching the
/// filesystem, so dangling links can still be attributed.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            other => result.push(other),
        }
    }
    result
}

/// Relative symlink contents for `prefix/<relative>` pointing at `source`.
fn relative_link(prefix: &Path, source: &Path, relative: &Path) -> PathBuf {
    let depth = relative.components().count().saturating_sub(1);
    let mut link = PathBuf::new();
    for _ in 0..depth {
        link.push("..");
    }
    match source.strip_prefix(prefix) {
        Ok(rel_source) => link.join(rel_source),
        Err(_) => source.to_path_buf(),
    }
}

/// Post-install path substitution.
///
/// Build steps may embed the staging directory or placeholder paths in
/// generated configuration; this pass rewrites `@@PREFIX@@`, `@@STORE@@`,
/// and friends in any UTF-8 text file of the payload to the final install
/// locations. `extra` carries literal pairs, such as the staging directory
/// that no longer exists after the payload moved to its final keg. Returns
/// how many files were rewritten.
pub fn substitute_tree(keg: &Path, env: &BuildEnv, extra: &[(String, String)]) -> Result<usize> {
    let files: Vec<PathBuf> = WalkDir::new(keg)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();

    let rewritten: Vec<anyhow::Result<bool>> = files
        .par_iter()
        .map(|path| substitute_file(path, env, extra))
        .collect();

    let mut count = 0;
    for result in rewritten {
        if result? {
            count += 1;
        }
    }
    Ok(count)
}

fn substitute_file(path: &Path, env: &BuildEnv, extra: &[(String, String)]) -> anyhow::Result<bool> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    // binary payloads are left alone; placeholder rewriting is for text
    let Ok(contents) = String::from_utf8(bytes) else {
        return Ok(false);
    };

    if !contents.contains("@@") && !extra.iter().any(|(from, _)| contents.contains(from)) {
        return Ok(false);
    }

    let mut replaced = env.expand(&contents);
    for (from, to) in extra {
        replaced = replaced.replace(from, to);
    }
    if replaced == contents {
        return Ok(false);
    }

    fs::write(path, replaced).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}
