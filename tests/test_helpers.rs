// Shared fixtures for the integration suites: an isolated prefix plus
// file:// source archives, so no test touches the network or the system.
#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use mashtun::store::Store;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated environment with its own prefix, recipe directory and source
/// cache. Everything is removed when the value drops.
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub store: Store,
    pub recipes: PathBuf,
    pub cache: PathBuf,
    pub sources: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let prefix = temp_dir.path().join("prefix");
        let recipes = temp_dir.path().join("recipes");
        let cache = temp_dir.path().join("cache");
        let sources = temp_dir.path().join("sources");
        for dir in [&prefix, &recipes, &cache, &sources] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self {
            temp_dir,
            store: Store::new(prefix),
            recipes,
            cache,
            sources,
        }
    }

    /// Create a gzipped tarball under `sources/` with a single top-level
    /// directory `{name}-{version}` holding `files`. Returns the file://
    /// URL and the archive's sha256 digest.
    pub fn make_archive(
        &self,
        name: &str,
        version: &str,
        files: &[(&str, &str)],
    ) -> (String, String) {
        let path = self.sources.join(format!("{name}-{version}.tar.gz"));
        let file = std::fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let root = format!("{name}-{version}");
        for (rel, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(
                    &mut header,
                    format!("{root}/{rel}"),
                    contents.as_bytes(),
                )
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let digest = sha256_of(&path);
        (format!("file://{}", path.display()), digest)
    }

    /// Write a recipe document into the recipe directory.
    pub fn write_recipe(&self, name: &str, toml: &str) {
        std::fs::write(self.recipes.join(format!("{name}.toml")), toml).unwrap();
    }

    /// A minimal recipe that copies `payload.txt` from its source into
    /// `<destdir>/share/<name>/payload.txt`.
    pub fn simple_recipe(&self, name: &str, version: &str, dependencies: &[&str]) {
        let (url, sha256) = self.make_archive(name, version, &[("payload.txt", name)]);
        let deps = dependencies
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let doc = format!(
            r#"
name = "{name}"
version = "{version}"
dependencies = [{deps}]

[source]
url = "{url}"
sha256 = "{sha256}"

[phases]
install = [
    ["mkdir", "-p", "@@DESTDIR@@/share/{name}"],
    ["cp", "@@SRC@@/payload.txt", "@@DESTDIR@@/share/{name}/payload.txt"],
]
"#
        );
        self.write_recipe(name, &doc);
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sha256_of(path: &Path) -> String {
    let data = std::fs::read(path).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&data);
    format!("{:x}", hasher.finalize())
}
