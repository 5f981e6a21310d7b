//! Recipe documents - the declarative description of one package.
//!
//! A recipe is a TOML file describing how to obtain, build, and install a
//! single package: metadata (name, version, license), a source locator with a
//! content hash, dependency lists tagged by kind, free-form environment
//! overrides, and ordered command lists per lifecycle phase.
//!
//! Commands are data, not shell text. Each command is an argv array (or a
//! whitespace-split string) executed directly, without a shell, so a recipe
//! cannot smuggle arbitrary shell syntax into the build.
//!
//! # Example
//!
//! ```toml
//! name = "hello"
//! version = "2.12"
//! license = "GPL-3.0-or-later"
//! dependencies = ["gettext"]
//! build_dependencies = ["pkgconf"]
//!
//! [source]
//! url = "https://example.org/hello-2.12.tar.gz"
//! sha256 = "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"
//!
//! [phases]
//! configure = [["./configure", "--prefix=@@PREFIX@@"]]
//! build = [["make"]]
//! install = [["make", "install", "DESTDIR=@@DESTDIR@@"]]
//! ```

use crate::error::{MashError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Source locator: where the upstream archive lives and what it must hash to.
///
/// Unknown keys are rejected so a top-level field accidentally placed under
/// `[source]` fails loudly instead of silently vanishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Source {
    pub url: String,
    pub sha256: String,
}

/// One external command: a program and its arguments.
///
/// Accepts either an argv array or a plain string split on whitespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line(String),
    Argv(Vec<String>),
}

impl Command {
    /// Resolve to (program, args). Empty commands are rejected at parse time
    /// by [`Recipe::validate`], so this only fails on malformed documents
    /// that bypassed validation.
    pub fn argv(&self) -> Result<(String, Vec<String>)> {
        let parts: Vec<String> = match self {
            Command::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Command::Argv(argv) => argv.clone(),
        };
        let mut iter = parts.into_iter();
        let program = iter
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty command in recipe"))?;
        Ok((program, iter.collect()))
    }

    fn is_empty(&self) -> bool {
        match self {
            Command::Line(line) => line.split_whitespace().next().is_none(),
            Command::Argv(argv) => argv.is_empty(),
        }
    }
}

/// Ordered command lists per lifecycle phase.
///
/// Fetch, verify, and unpack are not phases a recipe can override; they are
/// driven by the source locator alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Phases {
    #[serde(default)]
    pub patch: Vec<Command>,
    #[serde(default)]
    pub configure: Vec<Command>,
    #[serde(default)]
    pub build: Vec<Command>,
    #[serde(default)]
    pub install: Vec<Command>,
    #[serde(default)]
    pub post_install: Vec<Command>,
    #[serde(default)]
    pub test: Vec<Command>,
}

/// Service supervision descriptor, rendered at install time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    /// Command to run, relative paths resolved against the recipe's store dir
    pub run: Vec<String>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_link() -> bool {
    true
}

/// A parsed recipe document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub version: String,
    /// Bumped when recipe logic changes without a version bump; participates
    /// in the store directory name so prior artifacts are invalidated.
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    pub source: Source,
    /// Runtime dependencies, part of the closure exposed to consumers
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Needed to build but not to run
    #[serde(default)]
    pub build_dependencies: Vec<String>,
    /// Needed only by the test phase
    #[serde(default)]
    pub test_dependencies: Vec<String>,
    /// When false, the payload stays in the store and is not linked into the
    /// prefix ("keg-only")
    #[serde(default = "default_link")]
    pub link: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub phases: Phases,
    #[serde(default)]
    pub service: Option<Service>,
    #[serde(default)]
    pub caveats: Option<String>,
}

impl Recipe {
    /// Versioned identifier used for the store directory: `version` or
    /// `version_revision` when the revision counter is non-zero.
    pub fn pkg_version(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    /// Dependencies needed before this recipe can build (runtime + build).
    pub fn install_deps(&self) -> impl Iterator<Item = &String> {
        self.dependencies.iter().chain(&self.build_dependencies)
    }

    /// Whether the recipe declares a test phase.
    pub fn has_test(&self) -> bool {
        !self.phases.test.is_empty()
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let check = |ok: bool, msg: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("{}: {}", path.display(), msg).into())
            }
        };

        check(!self.name.is_empty(), "recipe name must not be empty")?;
        check(!self.version.is_empty(), "version must not be empty")?;
        check(
            self.source.sha256.len() == 64
                && self.source.sha256.chars().all(|c| c.is_ascii_hexdigit()),
            "source.sha256 must be a 64-character hex digest",
        )?;

        let all_phases = [
            &self.phases.patch,
            &self.phases.configure,
            &self.phases.build,
            &self.phases.install,
            &self.phases.post_install,
            &self.phases.test,
        ];
        for commands in all_phases {
            for command in commands {
                check(!command.is_empty(), "phase commands must not be empty")?;
            }
        }

        if let Some(service) = &self.service {
            check(!service.run.is_empty(), "service.run must not be empty")?;
        }

        Ok(())
    }
}

/// Path to a named recipe document inside a recipe directory.
pub fn recipe_path(recipe_dir: &Path, name: &str) -> PathBuf {
    recipe_dir.join(format!("{name}.toml"))
}

/// Load a single recipe by name from a recipe directory.
pub fn load(recipe_dir: &Path, name: &str) -> Result<Recipe> {
    let path = recipe_path(recipe_dir, name);
    if !path.exists() {
        return Err(MashError::RecipeNotFound(name.to_string()));
    }
    load_file(&path)
}

/// Load a recipe from an explicit file path.
pub fn load_file(path: &Path) -> Result<Recipe> {
    let contents = fs::read_to_string(path)?;
    let recipe: Recipe = toml::from_str(&contents).map_err(|source| MashError::RecipeParse {
        path: path.to_path_buf(),
        source,
    })?;
    recipe.validate(path)?;
    Ok(recipe)
}

/// Load every recipe in a directory. Used for reverse-dependency queries.
pub fn load_all(recipe_dir: &Path) -> Result<Vec<Recipe>> {
    let mut recipes = Vec::new();

    if !recipe_dir.exists() {
        return Ok(recipes);
    }

    for entry in fs::read_dir(recipe_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            recipes.push(load_file(&path)?);
        }
    }

    recipes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(recipes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        name = "hello"
        version = "2.12"

        [source]
        url = "https://example.org/hello-2.12.tar.gz"
        sha256 = "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"
    "#;

    #[test]
    fn parses_minimal_recipe_with_defaults() {
        let recipe: Recipe = toml::from_str(MINIMAL).unwrap();
        assert_eq!(recipe.name, "hello");
        assert_eq!(recipe.revision, 0);
        assert!(recipe.link);
        assert!(recipe.dependencies.is_empty());
        assert!(recipe.phases.configure.is_empty());
        assert!(recipe.service.is_none());
        assert!(!recipe.has_test());
    }

    #[test]
    fn pkg_version_includes_revision_suffix() {
        let mut recipe: Recipe = toml::from_str(MINIMAL).unwrap();
        assert_eq!(recipe.pkg_version(), "2.12");
        recipe.revision = 3;
        assert_eq!(recipe.pkg_version(), "2.12_3");
    }

    #[test]
    fn command_accepts_string_and_argv_forms() {
        let line = Command::Line("make install DESTDIR=/tmp/x".to_string());
        let (program, args) = line.argv().unwrap();
        assert_eq!(program, "make");
        assert_eq!(args, vec!["install", "DESTDIR=/tmp/x"]);

        let argv = Command::Argv(vec!["./configure".to_string(), "--prefix=/p".to_string()]);
        let (program, args) = argv.argv().unwrap();
        assert_eq!(program, "./configure");
        assert_eq!(args, vec!["--prefix=/p"]);
    }

    #[test]
    fn rejects_bad_checksum_length() {
        let doc = r#"
            name = "bad"
            version = "1.0"

            [source]
            url = "https://example.org/bad.tar.gz"
            sha256 = "deadbeef"
        "#;
        let recipe: Recipe = toml::from_str(doc).unwrap();
        assert!(recipe.validate(Path::new("bad.toml")).is_err());
    }

    #[test]
    fn rejects_empty_phase_command() {
        let doc = r#"
            name = "bad"
            version = "1.0"

            [source]
            url = "https://example.org/bad.tar.gz"
            sha256 = "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"

            [phases]
            build = [[]]
        "#;
        let recipe: Recipe = toml::from_str(doc).unwrap();
        assert!(recipe.validate(Path::new("bad.toml")).is_err());
    }

    #[test]
    fn parses_full_recipe() {
        let doc = r#"
            name = "interp"
            version = "8.5.0"
            revision = 3
            desc = "General-purpose scripting language"
            license = "PHP-3.01"
            link = false
            dependencies = ["libfoo", "libbar"]
            build_dependencies = ["bison", "re2c"]
            test_dependencies = ["httpd"]
            caveats = "Config lives under etc/interp"

            [source]
            url = "https://example.org/interp-8.5.0.tar.gz"
            sha256 = "71d55535a0a5002a789852a87028c4586a144f60848ca58266839f1c0632dd50"

            [env]
            BUILD_PROVIDER = "mash"

            [phases]
            configure = [["./configure", "--prefix=@@PREFIX@@"]]
            build = ["make"]
            install = [["make", "install"]]
            test = [["interp", "--version"]]

            [service]
            run = ["sbin/interp-fpm", "--nodaemonize"]
            keep_alive = true
            log = "var/log/interp-fpm.log"
        "#;
        let recipe: Recipe = toml::from_str(doc).unwrap();
        recipe.validate(Path::new("interp.toml")).unwrap();
        assert_eq!(recipe.pkg_version(), "8.5.0_3");
        assert!(!recipe.link);
        assert!(recipe.has_test());
        assert_eq!(recipe.install_deps().count(), 4);
        assert!(recipe.service.as_ref().unwrap().keep_alive);
        assert_eq!(recipe.env.get("BUILD_PROVIDER").unwrap(), "mash");
        assert_eq!(recipe.caveats.as_deref(), Some("Config lives under etc/interp"));
    }

    #[test]
    fn top_level_keys_under_source_are_rejected() {
        // dependency arrays placed below a table header belong to that
        // table in TOML; rejecting them beats silently installing a recipe
        // with no dependencies
        let doc = r#"
            name = "hello"
            version = "2.12"

            [source]
            url = "https://example.org/hello-2.12.tar.gz"
            sha256 = "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"
            dependencies = ["gettext"]
        "#;
        assert!(toml::from_str::<Recipe>(doc).is_err());
    }

    #[test]
    fn load_reports_missing_recipe() {
        let dir = tempfile::tempdir().unwrap();
        match load(dir.path(), "nope") {
            Err(MashError::RecipeNotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("expected RecipeNotFound, got {other:?}"),
        }
    }

    #[test]
    fn load_all_sorts_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha"] {
            let doc = MINIMAL.replace("hello", name);
            fs::write(dir.path().join(format!("{name}.toml")), doc).unwrap();
        }
        let recipes = load_all(dir.path()).unwrap();
        let names: Vec<_> = recipes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
