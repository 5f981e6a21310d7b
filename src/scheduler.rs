//! Pipeline orchestration across a resolved recipe set.
//!
//! Each recipe runs its lifecycle strictly sequentially; recipes with no
//! dependency relation run concurrently up to a parallelism limit. A failed
//! recipe skips its dependents but never aborts independent pipelines, and
//! the registry is only rewritten once a pipeline has fully succeeded, so a
//! failure can't clobber a previous working install.
//!
//! Builds stage into a hidden directory beside the final keg and move into
//! place on success; the post-install substitution pass then rewrites any
//! staging paths the build embedded in generated files.

use crate::error::{MashError, Result};
use crate::executor::{BuildEnv, Phase, RecipeState};
use crate::fetch;
use crate::installer;
use crate::manifest::{InstalledManifest, RuntimeDependency};
use crate::recipe::Recipe;
use crate::registry::Registry;
use crate::resolver::Graph;
use crate::service;
use crate::store::Store;
use anyhow::Context;
use indicatif::MultiProgress;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Default parallelism limit for independent pipelines.
pub const DEFAULT_JOBS: usize = 4;

/// How one recipe came out of a batch run.
#[derive(Debug)]
pub enum Outcome {
    Installed { pkg_version: String, linked: bool },
    AlreadyInstalled { pkg_version: String },
    Skipped { blocked_by: String },
    Failed(MashError),
}

/// Per-recipe results of an install run, in plan order.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub outcomes: Vec<(String, Outcome)>,
}

impl InstallReport {
    pub fn first_error(&self) -> Option<&MashError> {
        self.outcomes.iter().find_map(|(_, outcome)| match outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        })
    }

    pub fn installed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Installed { .. }))
            .count()
    }
}

/// Options for an install run.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Parallelism limit for independent recipes
    pub jobs: usize,
    /// Rebuild recipes that are already installed at the target version
    pub force: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            jobs: DEFAULT_JOBS,
            force: false,
        }
    }
}

/// A poisoned registry lock means another pipeline panicked mid-update;
/// surface that as an error instead of cascading the panic.
fn lock_registry(registry: &Mutex<Registry>) -> Result<std::sync::MutexGuard<'_, Registry>> {
    registry
        .lock()
        .map_err(|_| MashError::Other(anyhow::anyhow!("registry lock poisoned")))
}

/// Shared context for one install run.
pub struct Scheduler {
    store: Store,
    cache: PathBuf,
    client: reqwest::Client,
    registry: Arc<Mutex<Registry>>,
}

impl Scheduler {
    pub fn new(store: Store, cache: PathBuf) -> Result<Self> {
        let registry = Registry::load(&store)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(10))
            .user_agent(format!("mash/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            store,
            cache,
            client,
            registry: Arc::new(Mutex::new(registry)),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> Arc<Mutex<Registry>> {
        Arc::clone(&self.registry)
    }

    /// Install every recipe in the graph that `roots` needs, dependencies
    /// first. A cyclic graph fails up front and installs nothing.
    pub async fn install(
        &self,
        graph: Arc<Graph>,
        roots: &[String],
        options: &InstallOptions,
    ) -> Result<InstallReport> {
        let batches = graph.batches()?;
        let on_request: HashSet<&String> = roots.iter().collect();

        let progress = MultiProgress::new();
        let semaphore = Arc::new(Semaphore::new(options.jobs.max(1)));
        let mut report = InstallReport::default();
        // name -> why it is unavailable (failed itself, or blocked)
        let mut unavailable: HashMap<String, String> = HashMap::new();

        for batch in batches {
            let mut joinset = JoinSet::new();

            for idx in batch {
                let recipe = graph.recipe(idx).clone();
                let name = recipe.name.clone();

                // a dependency that failed earlier blocks this recipe; the
                // rest of the batch is unaffected
                let blocked = graph
                    .install_deps(idx)
                    .into_iter()
                    .map(|dep| graph.recipe(dep).name.clone())
                    .find(|dep| unavailable.contains_key(dep));
                if let Some(blocked_by) = blocked {
                    unavailable.insert(name.clone(), blocked_by.clone());
                    report.outcomes.push((name, Outcome::Skipped { blocked_by }));
                    continue;
                }

                if !options.force {
                    let installed = {
                        let registry = lock_registry(&self.registry)?;
                        registry
                            .get(&name)
                            .map(|entry| entry.pkg_version == recipe.pkg_version())
                            .unwrap_or(false)
                    };
                    if installed && self.store.keg(&name, &recipe.pkg_version()).exists() {
                        report.outcomes.push((
                            name,
                            Outcome::AlreadyInstalled {
                                pkg_version: recipe.pkg_version(),
                            },
                        ));
                        continue;
                    }
                }

                let pipeline = Pipeline {
                    store: self.store.clone(),
                    cache: self.cache.clone(),
                    client: self.client.clone(),
                    registry: Arc::clone(&self.registry),
                    graph: Arc::clone(&graph),
                    on_request: on_request.contains(&name),
                };
                let semaphore = Arc::clone(&semaphore);
                let progress = progress.clone();

                joinset.spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => pipeline.run(&recipe, &progress).await,
                        Err(e) => Err(MashError::Other(anyhow::anyhow!(
                            "scheduler semaphore closed: {e}"
                        ))),
                    };
                    (recipe, result)
                });
            }

            while let Some(joined) = joinset.join_next().await {
                let (recipe, result) = joined.context("pipeline task panicked")?;
                match result {
                    Ok(linked) => {
                        report.outcomes.push((
                            recipe.name.clone(),
                            Outcome::Installed {
                                pkg_version: recipe.pkg_version(),
                                linked,
                            },
                        ));
                    }
                    Err(e) => {
                        warn!(recipe = %recipe.name, error = %e, "pipeline failed");
                        unavailable.insert(recipe.name.clone(), recipe.name.clone());
                        report.outcomes.push((recipe.name.clone(), Outcome::Failed(e)));
                    }
                }
            }
        }

        Ok(report)
    }
}

/// One recipe's lifecycle run.
struct Pipeline {
    store: Store,
    cache: PathBuf,
    client: reqwest::Client,
    registry: Arc<Mutex<Registry>>,
    graph: Arc<Graph>,
    on_request: bool,
}

impl Pipeline {
    /// Drive the state machine for one recipe. Returns whether the payload
    /// was linked into the prefix.
    async fn run(&self, recipe: &Recipe, progress: &MultiProgress) -> Result<bool> {
        let mut state = RecipeState::Pending;
        let result = self.run_inner(recipe, progress, &mut state).await;
        if result.is_err() {
            state = RecipeState::Failed;
        }
        info!(recipe = %recipe.name, %state, "pipeline finished");
        result
    }

    async fn run_inner(
        &self,
        recipe: &Recipe,
        progress: &MultiProgress,
        state: &mut RecipeState,
    ) -> Result<bool> {
        let pkg_version = recipe.pkg_version();

        // fetch, then verify; a checksum mismatch stops the recipe here,
        // before any configure step can run
        *state = RecipeState::Fetching;
        let archive =
            fetch::ensure_fetched(recipe, &self.client, &self.cache, Some(progress)).await?;
        *state = RecipeState::Verifying;
        fetch::verify_source(recipe, &archive).await?;

        // stale build dirs are wiped, not reused
        *state = RecipeState::Unpacking;
        let build_dir = self.store.build_dir(&recipe.name, &pkg_version);
        if build_dir.exists() {
            fs::remove_dir_all(&build_dir)
                .with_context(|| format!("Failed to clear build dir: {}", build_dir.display()))?;
        }
        let source_root = {
            let archive = archive.clone();
            let build_dir = build_dir.clone();
            tokio::task::spawn_blocking(move || crate::unpack::unpack_source(&archive, &build_dir))
                .await
                .context("unpack task panicked")??
        };

        // build into a hidden staging directory; the previous keg (and its
        // manifest) stay intact until the new payload is complete
        let keg = self.store.keg(&recipe.name, &pkg_version);
        let staging = self
            .store
            .store_dir()
            .join(&recipe.name)
            .join(format!(".staging-{pkg_version}"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create staging dir: {}", staging.display()))?;

        let build_env = BuildEnv::new(
            recipe,
            self.store.prefix(),
            &self.store.store_dir(),
            &staging,
            &source_root,
        );

        for phase in [Phase::Patch, Phase::Configure, Phase::Build, Phase::Install] {
            *state = phase.running_state();
            crate::executor::run_phase(recipe, phase, &source_root, &build_env).await?;
        }

        // move the finished payload into place
        if keg.exists() {
            fs::remove_dir_all(&keg)
                .with_context(|| format!("Failed to replace keg: {}", keg.display()))?;
        }
        fs::rename(&staging, &keg)
            .with_context(|| format!("Failed to move payload into place: {}", keg.display()))?;

        *state = RecipeState::PostInstalling;
        let final_env = BuildEnv::new(
            recipe,
            self.store.prefix(),
            &self.store.store_dir(),
            &keg,
            &source_root,
        );
        let stale_paths = vec![(staging.display().to_string(), keg.display().to_string())];
        {
            let keg = keg.clone();
            let env = final_env.clone();
            tokio::task::spawn_blocking(move || installer::substitute_tree(&keg, &env, &stale_paths))
                .await
                .context("substitution task panicked")??;
        }
        crate::executor::run_phase(recipe, Phase::PostInstall, &keg, &final_env).await?;

        // expose the payload; prefix writes and registry updates are
        // serialized under one lock so concurrent pipelines can't race on a
        // path claim
        let linked = {
            let mut registry = lock_registry(&self.registry)?;
            let linked_files = if recipe.link {
                let candidates = installer::linkable_paths(&keg)?;
                registry.check_conflicts(&recipe.name, &candidates)?;
                installer::link_keg(&self.store, &recipe.name, &keg)?
            } else {
                // keg-only: payload stays in the store, claims no paths
                Vec::new()
            };
            let linked = !linked_files.is_empty();

            service::render(&self.store, recipe, &keg, &final_env)?;

            let manifest = InstalledManifest::new(
                recipe,
                linked_files,
                self.runtime_dependencies(recipe),
                self.on_request,
            );
            manifest.write(&keg)?;
            registry.record_install(&manifest)?;
            linked
        };

        let _ = fs::remove_dir_all(&build_dir);
        *state = RecipeState::Installed;
        Ok(linked)
    }

    /// Resolved runtime closure recorded in the manifest: direct deps are
    /// flagged, transitive ones are not.
    fn runtime_dependencies(&self, recipe: &Recipe) -> Vec<RuntimeDependency> {
        let Some(idx) = self.graph.index_of(&recipe.name) else {
            return Vec::new();
        };
        let direct: HashSet<&String> = recipe.dependencies.iter().collect();

        self.graph
            .runtime_closure(idx)
            .into_iter()
            .map(|dep| {
                let dep = self.graph.recipe(dep);
                RuntimeDependency {
                    name: dep.name.clone(),
                    pkg_version: dep.pkg_version(),
                    declared_directly: direct.contains(&dep.name),
                }
            })
            .collect()
    }
}

/// Run a recipe's declared test phase against its installed payload.
///
/// Moves the state machine from `Installed` to `Tested` on success; a recipe
/// without a test phase is a no-op.
pub async fn run_test(store: &Store, recipe: &Recipe) -> Result<RecipeState> {
    if !recipe.has_test() {
        return Ok(RecipeState::Installed);
    }

    let pkg_version = recipe.pkg_version();
    let keg = store.keg(&recipe.name, &pkg_version);
    if !keg.exists() {
        return Err(MashError::NotInstalled(recipe.name.clone()));
    }

    // tests get a scratch working directory, wiped per run
    let workdir = store.prefix().join("var/test").join(&recipe.name);
    if workdir.exists() {
        fs::remove_dir_all(&workdir)?;
    }
    fs::create_dir_all(&workdir)?;

    let env = BuildEnv::new(recipe, store.prefix(), &store.store_dir(), &keg, &workdir);
    crate::executor::run_phase(recipe, Phase::Test, &workdir, &env).await?;

    info!(recipe = %recipe.name, "test passed");
    Ok(RecipeState::Tested)
}

/// Remove an installed recipe: links, service descriptor, payload, registry
/// entry. Other recipes are untouched.
pub fn uninstall(store: &Store, registry: &mut Registry, name: &str) -> Result<Option<String>> {
    let Some(entry) = registry.record_uninstall(name)? else {
        return Ok(None);
    };

    installer::unlink_keg(store, name, &entry.linked_files)?;
    service::remove(store, name)?;

    let keg = store.keg(name, &entry.pkg_version);
    if keg.exists() {
        fs::remove_dir_all(&keg)
            .with_context(|| format!("Failed to remove payload: {}", keg.display()))?;
    }
    // drop the recipe's store directory once its last version is gone
    let recipe_dir = store.store_dir().join(name);
    if recipe_dir.exists() && fs::read_dir(&recipe_dir)?.next().is_none() {
        let _ = fs::remove_dir(&recipe_dir);
    }

    Ok(Some(entry.pkg_version))
}

/// Installed recipes that `name` is a runtime dependency of, per their
/// manifests. Used to refuse unsafe uninstalls.
pub fn installed_dependents(store: &Store, registry: &Registry, name: &str) -> Vec<String> {
    let mut dependents = Vec::new();
    for (installed, entry) in registry.iter() {
        if installed == name {
            continue;
        }
        let keg = store.keg(installed, &entry.pkg_version);
        if let Ok(manifest) = InstalledManifest::read(&keg) {
            if manifest.runtime_dependencies.iter().any(|d| d.name == *name) {
                dependents.push(installed.clone());
            }
        }
    }
    dependents
}
