//! Lifecycle phase execution.
//!
//! Each recipe moves through a fixed state machine; the declared phases run
//! strictly sequentially as external process invocations with captured
//! output. A non-zero exit aborts the remaining phases of that recipe only.
//! Processes are spawned with `kill_on_drop`, so dropping a pipeline future
//! terminates whatever is still running.

use crate::error::{MashError, Result};
use crate::recipe::{Command, Recipe};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Per-recipe lifecycle state.
///
/// `Failed` is reachable from every non-terminal state; `Tested` only from
/// `Installed`, and only when the recipe declares a test phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeState {
    Pending,
    Fetching,
    Verifying,
    Unpacking,
    Patching,
    Configuring,
    Building,
    Installing,
    PostInstalling,
    Installed,
    Tested,
    Failed,
}

impl RecipeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecipeState::Installed | RecipeState::Tested | RecipeState::Failed
        )
    }
}

impl fmt::Display for RecipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecipeState::Pending => "pending",
            RecipeState::Fetching => "fetching",
            RecipeState::Verifying => "verifying",
            RecipeState::Unpacking => "unpacking",
            RecipeState::Patching => "patching",
            RecipeState::Configuring => "configuring",
            RecipeState::Building => "building",
            RecipeState::Installing => "installing",
            RecipeState::PostInstalling => "post-installing",
            RecipeState::Installed => "installed",
            RecipeState::Tested => "tested",
            RecipeState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// The command-bearing lifecycle phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Patch,
    Configure,
    Build,
    Install,
    PostInstall,
    Test,
}

impl Phase {
    /// Phases run during `mash install`, in order.
    pub const INSTALL_ORDER: [Phase; 5] = [
        Phase::Patch,
        Phase::Configure,
        Phase::Build,
        Phase::Install,
        Phase::PostInstall,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Patch => "patch",
            Phase::Configure => "configure",
            Phase::Build => "build",
            Phase::Install => "install",
            Phase::PostInstall => "post-install",
            Phase::Test => "test",
        }
    }

    pub fn commands(self, recipe: &Recipe) -> &[Command] {
        match self {
            Phase::Patch => &recipe.phases.patch,
            Phase::Configure => &recipe.phases.configure,
            Phase::Build => &recipe.phases.build,
            Phase::Install => &recipe.phases.install,
            Phase::PostInstall => &recipe.phases.post_install,
            Phase::Test => &recipe.phases.test,
        }
    }

    pub fn running_state(self) -> RecipeState {
        match self {
            Phase::Patch => RecipeState::Patching,
            Phase::Configure => RecipeState::Configuring,
            Phase::Build => RecipeState::Building,
            Phase::Install => RecipeState::Installing,
            Phase::PostInstall => RecipeState::PostInstalling,
            // the state machine stays at Installed while tests run
            Phase::Test => RecipeState::Installed,
        }
    }
}

/// Placeholders expanded in commands, recipe env values, and staged config.
pub const PREFIX_PLACEHOLDER: &str = "@@PREFIX@@";
pub const STORE_PLACEHOLDER: &str = "@@STORE@@";
pub const DESTDIR_PLACEHOLDER: &str = "@@DESTDIR@@";
pub const SRC_PLACEHOLDER: &str = "@@SRC@@";

/// Environment for one recipe's phase executions.
///
/// Created before the first step, discarded after the last; never shared
/// between recipes.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    vars: BTreeMap<String, String>,
    prefix: PathBuf,
    store_root: PathBuf,
    destdir: PathBuf,
    source_root: PathBuf,
}

impl BuildEnv {
    pub fn new(
        recipe: &Recipe,
        prefix: &Path,
        store_root: &Path,
        destdir: &Path,
        source_root: &Path,
    ) -> Self {
        let mut env = Self {
            vars: BTreeMap::new(),
            prefix: prefix.to_path_buf(),
            store_root: store_root.to_path_buf(),
            destdir: destdir.to_path_buf(),
            source_root: source_root.to_path_buf(),
        };

        env.vars
            .insert("MASH_PREFIX".to_string(), prefix.display().to_string());
        env.vars
            .insert("MASH_DESTDIR".to_string(), destdir.display().to_string());
        env.vars
            .insert("MASH_PKG_VERSION".to_string(), recipe.pkg_version());

        // Recipe overrides go through placeholder expansion too, so an env
        // value can embed the final prefix.
        for (key, value) in &recipe.env {
            let value = env.expand(value);
            env.vars.insert(key.clone(), value);
        }

        env
    }

    /// Expand path placeholders in a string.
    pub fn expand(&self, input: &str) -> String {
        input
            .replace(PREFIX_PLACEHOLDER, &self.prefix.display().to_string())
            .replace(STORE_PLACEHOLDER, &self.store_root.display().to_string())
            .replace(DESTDIR_PLACEHOLDER, &self.destdir.display().to_string())
            .replace(SRC_PLACEHOLDER, &self.source_root.display().to_string())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// Tail of captured stdout+stderr kept in a failure report.
const CAPTURE_LIMIT: usize = 8 * 1024;

fn capture_tail(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(stdout));
    combined.push_str(&String::from_utf8_lossy(stderr));
    if combined.len() > CAPTURE_LIMIT {
        // keep the tail; that is where build systems print the real error
        let mut cut = combined.len() - CAPTURE_LIMIT;
        while !combined.is_char_boundary(cut) {
            cut += 1;
        }
        combined = combined[cut..].to_string();
    }
    combined
}

/// Run all commands of one phase sequentially in `cwd` under `env`.
///
/// The first non-zero exit aborts the phase with a failure carrying the
/// captured output. Test phases report [`MashError::TestFailure`], everything
/// else [`MashError::StepFailure`].
pub async fn run_phase(
    recipe: &Recipe,
    phase: Phase,
    cwd: &Path,
    env: &BuildEnv,
) -> Result<()> {
    for command in phase.commands(recipe) {
        let (program, args) = command.argv()?;
        let program = env.expand(&program);
        let args: Vec<String> = args.iter().map(|a| env.expand(a)).collect();

        debug!(recipe = %recipe.name, phase = phase.name(), %program, "running step");

        let output = tokio::process::Command::new(&program)
            .args(&args)
            .current_dir(cwd)
            .envs(env.vars())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Err(step_error(
                    recipe,
                    phase,
                    None,
                    format!("failed to spawn {program}: {e}"),
                ));
            }
        };

        if !output.status.success() {
            return Err(step_error(
                recipe,
                phase,
                output.status.code(),
                capture_tail(&output.stdout, &output.stderr),
            ));
        }
    }

    Ok(())
}

fn step_error(recipe: &Recipe, phase: Phase, exit_code: Option<i32>, output: String) -> MashError {
    if phase == Phase::Test {
        MashError::TestFailure {
            recipe: recipe.name.clone(),
            exit_code,
            output,
        }
    } else {
        MashError::StepFailure {
            recipe: recipe.name.clone(),
            phase: phase.name(),
            exit_code,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe_with_phases(phases: &str) -> Recipe {
        let doc = format!(
            r#"
            name = "probe"
            version = "1.0"

            [source]
            url = "file:///dev/null"
            sha256 = "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"

            [env]
            PROBE_VAR = "@@PREFIX@@/etc"

            [phases]
            {phases}
            "#
        );
        toml::from_str(&doc).unwrap()
    }

    fn env_for(recipe: &Recipe, root: &Path) -> BuildEnv {
        BuildEnv::new(
            recipe,
            &root.join("prefix"),
            &root.join("prefix/store"),
            &root.join("destdir"),
            &root.join("src"),
        )
    }

    #[test]
    fn expands_placeholders() {
        let recipe = recipe_with_phases("");
        let env = env_for(&recipe, Path::new("/t"));
        assert_eq!(
            env.expand("--prefix=@@PREFIX@@ @@DESTDIR@@/x"),
            "--prefix=/t/prefix /t/destdir/x"
        );
        assert_eq!(env.vars().get("PROBE_VAR").unwrap(), "/t/prefix/etc");
        assert_eq!(env.vars().get("MASH_PKG_VERSION").unwrap(), "1.0");
    }

    #[tokio::test]
    async fn successful_phase_runs_all_commands() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe_with_phases(
            r#"build = [["touch", "one"], ["touch", "two"]]"#,
        );
        let env = env_for(&recipe, dir.path());

        run_phase(&recipe, Phase::Build, dir.path(), &env)
            .await
            .unwrap();
        assert!(dir.path().join("one").exists());
        assert!(dir.path().join("two").exists());
    }

    #[tokio::test]
    async fn failing_command_aborts_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe_with_phases(
            r#"build = [["false"], ["touch", "never"]]"#,
        );
        let env = env_for(&recipe, dir.path());

        match run_phase(&recipe, Phase::Build, dir.path(), &env).await {
            Err(MashError::StepFailure {
                recipe,
                phase,
                exit_code,
                ..
            }) => {
                assert_eq!(recipe, "probe");
                assert_eq!(phase, "build");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("expected StepFailure, got {other:?}"),
        }
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn step_failure_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe_with_phases(r#"build = [["cat", "no-such-file"]]"#);
        let env = env_for(&recipe, dir.path());

        let err = run_phase(&recipe, Phase::Build, dir.path(), &env)
            .await
            .unwrap_err();
        let output = err.captured_output().expect("output captured");
        assert!(output.contains("no-such-file"), "got: {output}");
    }

    #[tokio::test]
    async fn test_phase_failure_is_test_failure() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe_with_phases(r#"test = [["false"]]"#);
        let env = env_for(&recipe, dir.path());

        assert!(matches!(
            run_phase(&recipe, Phase::Test, dir.path(), &env).await,
            Err(MashError::TestFailure { .. })
        ));
    }

    #[tokio::test]
    async fn missing_program_is_step_failure() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe_with_phases(r#"build = [["mash-no-such-program-xyz"]]"#);
        let env = env_for(&recipe, dir.path());

        assert!(matches!(
            run_phase(&recipe, Phase::Build, dir.path(), &env).await,
            Err(MashError::StepFailure { exit_code: None, .. })
        ));
    }

    #[test]
    fn state_machine_terminals() {
        assert!(RecipeState::Installed.is_terminal());
        assert!(RecipeState::Tested.is_terminal());
        assert!(RecipeState::Failed.is_terminal());
        assert!(!RecipeState::Configuring.is_terminal());
        assert_eq!(Phase::Configure.running_state(), RecipeState::Configuring);
    }
}
