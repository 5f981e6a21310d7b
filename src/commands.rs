//! CLI command handlers: thin, colorful wrappers over the library modules.

use crate::error::{MashError, Result};
use crate::manifest::InstalledManifest;
use crate::recipe;
use crate::registry::Registry;
use crate::resolver::{self, Graph};
use crate::scheduler::{self, InstallOptions, Outcome, Scheduler};
use crate::service;
use crate::store::Store;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

/// Install recipes (and their dependency closures) from a recipe directory.
pub async fn install(
    store: &Store,
    recipe_dir: &Path,
    cache: &Path,
    names: &[String],
    options: &InstallOptions,
) -> Result<()> {
    let recipes = resolver::load_closure(recipe_dir, names)?;
    let graph = Arc::new(Graph::build(recipes)?);

    println!(
        "{} Installing {} ({} recipes in plan)",
        "==>".bold().green(),
        names.join(", ").bold(),
        graph.len()
    );

    let scheduler = Scheduler::new(store.clone(), cache.to_path_buf())?;
    let report = scheduler.install(Arc::clone(&graph), names, options).await?;

    let installed_count = report.installed_count();
    let mut first_failure = None;
    for (name, outcome) in report.outcomes {
        match outcome {
            Outcome::Installed {
                pkg_version,
                linked,
            } => {
                let suffix = if linked { "" } else { " (not linked)" };
                println!("{} {} {}{}", "✓".green(), name.bold(), pkg_version, suffix);
            }
            Outcome::AlreadyInstalled { pkg_version } => {
                println!(
                    "{} {} {} already installed",
                    "-".dimmed(),
                    name.bold(),
                    pkg_version
                );
            }
            Outcome::Skipped { blocked_by } => {
                println!(
                    "{} {} skipped (dependency {} failed)",
                    "!".yellow(),
                    name.bold(),
                    blocked_by
                );
            }
            Outcome::Failed(e) => {
                println!("{} {} {}", "✗".red(), name.bold(), e);
                if let Some(output) = e.captured_output() {
                    for line in output.lines() {
                        println!("    {}", line.dimmed());
                    }
                }
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_failure {
        return Err(e);
    }

    println!(
        "\n{} {} installed",
        "✓".green(),
        format!("{installed_count} recipe(s)").bold()
    );
    for name in names {
        let recipe = recipe::load(recipe_dir, name)?;
        if let Some(caveats) = &recipe.caveats {
            println!("\n{} Caveats for {}:", "==>".bold().yellow(), name.bold());
            let expanded = caveats.replace(
                crate::executor::PREFIX_PLACEHOLDER,
                &store.prefix().display().to_string(),
            );
            for line in expanded.lines() {
                println!("  {line}");
            }
        }
    }
    Ok(())
}

/// Run a recipe's declared test phase.
pub async fn test(store: &Store, recipe_dir: &Path, name: &str) -> Result<()> {
    let recipe = recipe::load(recipe_dir, name)?;

    if !recipe.has_test() {
        println!("{} {} declares no test phase", "-".dimmed(), name.bold());
        return Ok(());
    }

    println!("{} Testing {}", "==>".bold().green(), name.bold());
    scheduler::run_test(store, &recipe).await?;
    println!("{} {} test passed", "✓".green(), name.bold());
    Ok(())
}

/// Download and verify sources without building.
pub async fn fetch(recipe_dir: &Path, cache: &Path, names: &[String]) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .user_agent(format!("mash/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(MashError::Http)?;

    let progress = indicatif::MultiProgress::new();
    let mut tasks = tokio::task::JoinSet::new();

    for name in names {
        let recipe = recipe::load(recipe_dir, name)?;
        let client = client.clone();
        let cache = cache.to_path_buf();
        let progress = progress.clone();
        tasks.spawn(async move {
            let result = crate::fetch::fetch_source(&recipe, &client, &cache, Some(&progress)).await;
            (recipe.name, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let (name, result) = joined.map_err(|e| anyhow::anyhow!("fetch task panicked: {e}"))?;
        match result {
            Ok(path) => println!("{} {} -> {}", "✓".green(), name.bold(), path.display()),
            Err(e) => {
                println!("{} {} {}", "✗".red(), name.bold(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Remove installed recipes.
pub fn uninstall(store: &Store, names: &[String], force: bool) -> Result<()> {
    let mut registry = Registry::load(store)?;

    for name in names {
        if !registry.is_installed(name) {
            return Err(MashError::NotInstalled(name.clone()));
        }

        let dependents = scheduler::installed_dependents(store, &registry, name);
        if !dependents.is_empty() && !force {
            println!(
                "{} {} is required by: {}",
                "✗".red(),
                name.bold(),
                dependents.join(", ")
            );
            println!("  Use {} to remove anyway", "--force".bold());
            return Err(anyhow::anyhow!("refusing to uninstall {name}").into());
        }

        match scheduler::uninstall(store, &mut registry, name)? {
            Some(pkg_version) => {
                println!("{} Uninstalled {} {}", "✓".green(), name.bold(), pkg_version);
            }
            None => println!("{} {} was not installed", "-".dimmed(), name.bold()),
        }
    }

    Ok(())
}

/// List installed recipes.
pub fn list(store: &Store, versions: bool) -> Result<()> {
    let registry = Registry::load(store)?;

    let mut count = 0;
    for (name, entry) in registry.iter() {
        if versions {
            let all = store.installed_versions(name)?;
            println!("{} {}", name.bold(), all.join(" "));
        } else {
            println!("{} {}", name.bold(), entry.pkg_version);
        }
        count += 1;
    }

    if count == 0 {
        println!("{}", "No recipes installed".dimmed());
    }
    Ok(())
}

/// Show recipe metadata and install status.
pub fn info(store: &Store, recipe_dir: &Path, name: &str) -> Result<()> {
    let recipe = recipe::load(recipe_dir, name)?;
    let registry = Registry::load(store)?;

    println!("{}", format!("==> {}", recipe.name).bold().green());
    if let Some(desc) = &recipe.desc {
        println!("{desc}");
    }
    if let Some(homepage) = &recipe.homepage {
        println!("{}: {}", "Homepage".bold(), homepage);
    }
    println!("{}: {}", "Version".bold(), recipe.pkg_version());
    if let Some(license) = &recipe.license {
        println!("{}: {}", "License".bold(), license);
    }
    println!("{}: {}", "Source".bold(), recipe.source.url);

    if !recipe.dependencies.is_empty() {
        println!("{}: {}", "Dependencies".bold(), recipe.dependencies.join(", "));
    }
    if !recipe.build_dependencies.is_empty() {
        println!(
            "{}: {}",
            "Build dependencies".bold(),
            recipe.build_dependencies.join(", ")
        );
    }
    if !recipe.link {
        println!("{}", "Not linked into the prefix (keg-only)".yellow());
    }

    match registry.get(name) {
        Some(entry) => {
            let keg = store.keg(name, &entry.pkg_version);
            println!(
                "{}: {} ({} files linked)",
                "Installed".bold().green(),
                entry.pkg_version,
                entry.linked_files.len()
            );
            if let Ok(manifest) = InstalledManifest::read(&keg) {
                let when = chrono::DateTime::from_timestamp(manifest.time, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| manifest.time.to_string());
                println!("{}: {}", "Installed at".bold(), when);
            }
        }
        None => println!("{}: not installed", "Installed".bold()),
    }

    Ok(())
}

/// Show a recipe's dependencies, flat or as a tree.
pub fn deps(recipe_dir: &Path, name: &str, tree: bool) -> Result<()> {
    let recipes = resolver::load_closure(recipe_dir, &[name.to_string()])?;
    let graph = Graph::build(recipes)?;
    let root = graph
        .index_of(name)
        .ok_or_else(|| MashError::RecipeNotFound(name.to_string()))?;

    if tree {
        print_dep_tree(&graph, root, 0);
    } else {
        let mut names: Vec<&str> = graph
            .runtime_closure(root)
            .into_iter()
            .map(|i| graph.recipe(i).name.as_str())
            .collect();
        names.sort_unstable();
        for dep in names {
            println!("{dep}");
        }
        let recipe = graph.recipe(root);
        for build_dep in &recipe.build_dependencies {
            println!("{} {}", build_dep, "(build)".dimmed());
        }
    }
    Ok(())
}

fn print_dep_tree(graph: &Graph, idx: usize, depth: usize) {
    let recipe = graph.recipe(idx);
    if depth == 0 {
        println!("{}", recipe.name.bold());
    } else {
        println!("{}{} {}", "  ".repeat(depth), "└─".dimmed(), recipe.name);
    }
    for dep in &recipe.dependencies {
        if let Some(dep_idx) = graph.index_of(dep) {
            print_dep_tree(graph, dep_idx, depth + 1);
        }
    }
}

/// Show recipes in the recipe directory that depend on `name`.
pub fn uses(recipe_dir: &Path, name: &str) -> Result<()> {
    let recipes = recipe::load_all(recipe_dir)?;
    let mut found = false;

    for r in &recipes {
        let runtime = r.dependencies.iter().any(|d| d == name);
        let build = r.build_dependencies.iter().any(|d| d == name);
        if runtime || build {
            let tag = if build && !runtime {
                " (build)".dimmed().to_string()
            } else {
                String::new()
            };
            println!("{}{}", r.name, tag);
            found = true;
        }
    }

    if !found {
        println!("{}", format!("Nothing depends on {name}").dimmed());
    }
    Ok(())
}

/// List rendered service descriptors.
pub fn services(store: &Store) -> Result<()> {
    let descriptors = service::list(store)?;

    if descriptors.is_empty() {
        println!("{}", "No services installed".dimmed());
        return Ok(());
    }

    println!("{}", "==> Services".bold().green());
    for d in descriptors {
        let keep = if d.keep_alive { "keep-alive" } else { "one-shot" };
        println!(
            "{} {} {} {}",
            d.name.bold(),
            d.pkg_version,
            keep.dimmed(),
            d.run.join(" ").dimmed()
        );
    }
    Ok(())
}
