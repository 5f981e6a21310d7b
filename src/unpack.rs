//! Source archive extraction into the per-recipe build directory.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;

/// Unpack a tar.gz archive into `build_dir` and locate the source root.
///
/// Upstream archives conventionally wrap everything in a single top-level
/// directory (`hello-2.12/...`); when present, that directory is the source
/// root. Flat archives use `build_dir` itself.
pub fn unpack_source(archive_path: &Path, build_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(build_dir)
        .with_context(|| format!("Failed to create build directory: {}", build_dir.display()))?;

    let file = fs::File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;
    let decompressor = GzDecoder::new(file);
    let mut archive = Archive::new(decompressor);

    archive
        .unpack(build_dir)
        .with_context(|| format!("Failed to extract archive to: {}", build_dir.display()))?;

    source_root(build_dir)
}

fn source_root(build_dir: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(build_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        entries.push(entry.path());
    }

    match entries.as_slice() {
        [single] if single.is_dir() => Ok(single.clone()),
        [] => anyhow::bail!("Archive was empty: {}", build_dir.display()),
        _ => Ok(build_dir.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn make_archive(dir: &Path, paths: &[(&str, &str)]) -> PathBuf {
        let archive_path = dir.join("src.tar.gz");
        let file = fs::File::create(&archive_path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (path, contents) in paths {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        archive_path
    }

    #[test]
    fn strips_single_top_level_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_archive(
            dir.path(),
            &[
                ("hello-2.12/configure", "#!/bin/sh\n"),
                ("hello-2.12/src/main.c", "int main(void) { return 0; }\n"),
            ],
        );

        let build_dir = dir.path().join("build");
        let root = unpack_source(&archive, &build_dir).unwrap();
        assert_eq!(root, build_dir.join("hello-2.12"));
        assert!(root.join("configure").exists());
        assert!(root.join("src/main.c").exists());
    }

    #[test]
    fn flat_archive_uses_build_dir_as_root() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_archive(dir.path(), &[("configure", "x"), ("Makefile", "y")]);

        let build_dir = dir.path().join("build");
        let root = unpack_source(&archive, &build_dir).unwrap();
        assert_eq!(root, build_dir);
        assert!(root.join("Makefile").exists());
    }
}
