use clap::{Parser, Subcommand};
use colored::Colorize;
use mashtun::scheduler::{InstallOptions, DEFAULT_JOBS};
use mashtun::store::Store;
use mashtun::{commands, fetch};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mash")]
#[command(author, version, about = "A declarative package recipe evaluator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Recipe directory (defaults to $MASH_RECIPES or <prefix>/recipes)
    #[arg(long, global = true)]
    recipes: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install recipes and their dependencies
    Install {
        /// Recipe names
        names: Vec<String>,

        /// Maximum number of recipes built in parallel
        #[arg(short, long, default_value_t = DEFAULT_JOBS)]
        jobs: usize,

        /// Rebuild even if the same version is already installed
        #[arg(long)]
        force: bool,
    },

    /// Run a recipe's test phase against the installed keg
    Test {
        /// Recipe name
        name: String,
    },

    /// Download and verify source archives without building
    Fetch {
        /// Recipe names
        names: Vec<String>,
    },

    /// Uninstall recipes
    Uninstall {
        /// Recipe names
        names: Vec<String>,

        /// Ignore installed dependents
        #[arg(long)]
        force: bool,
    },

    /// List installed recipes
    List {
        /// Show all installed versions
        #[arg(long)]
        versions: bool,
    },

    /// Show information about a recipe
    Info {
        /// Recipe name
        name: String,
    },

    /// Show dependencies for a recipe
    Deps {
        /// Recipe name
        name: String,

        /// Show as tree
        #[arg(long)]
        tree: bool,
    },

    /// Show recipes that depend on a recipe
    Uses {
        /// Recipe name
        name: String,
    },

    /// List installed service descriptors
    Services,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let store = Store::detect();
    let recipe_dir = cli
        .recipes
        .or_else(|| std::env::var_os("MASH_RECIPES").map(PathBuf::from))
        .unwrap_or_else(|| store.prefix().join("recipes"));
    let cache = fetch::cache_dir();

    let result = match cli.command {
        Some(Commands::Install { names, jobs, force }) => {
            let options = InstallOptions { jobs, force };
            commands::install(&store, &recipe_dir, &cache, &names, &options).await
        }
        Some(Commands::Test { name }) => commands::test(&store, &recipe_dir, &name).await,
        Some(Commands::Fetch { names }) => commands::fetch(&recipe_dir, &cache, &names).await,
        Some(Commands::Uninstall { names, force }) => commands::uninstall(&store, &names, force),
        Some(Commands::List { versions }) => commands::list(&store, versions),
        Some(Commands::Info { name }) => commands::info(&store, &recipe_dir, &name),
        Some(Commands::Deps { name, tree }) => commands::deps(&recipe_dir, &name, tree),
        Some(Commands::Uses { name }) => commands::uses(&recipe_dir, &name),
        Some(Commands::Services) => commands::services(&store),
        None => {
            println!("{} mash - a declarative package recipe evaluator", "==>".bold().green());
            println!("\nRun {} to see available commands.", "mash --help".cyan());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
}
