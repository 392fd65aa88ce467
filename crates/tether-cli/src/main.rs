//! Tether CLI - package manager and execution runtime for Tether modules.
//!
//! A thin frontend: every command parses its arguments, calls into the
//! core crates, and renders the outcome. Exit code 0 on success,
//! non-zero on any component failure, with the failure surfaced as a
//! human-readable message.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_archive::PackageArchive;
use tether_core::{ManifestOverrides, StepResult};
use tether_engine::{Engine, EngineOptions};
use tether_resolver::{registry_from_config, ProjectConfig, ReferenceDeclaration};
use tether_store::{ModuleStore, ProcessEnvironmentProvider};

/// Tether - module package manager and sandboxed runtime
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store root directory (defaults to ~/.tether)
    #[arg(long, global = true, env = "TETHER_STORE_ROOT")]
    store_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a project (.tether/deps.toml)
    Init,

    /// Install the project's declared dependencies
    Sync,

    /// Package a module directory into a .tether archive
    Package {
        /// Module source directory
        module_dir: PathBuf,

        /// Output directory (defaults to the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Install a packaged module, or the current directory when no
    /// package is given
    Install {
        /// Path to a .tether package
        package: Option<PathBuf>,
    },

    /// Remove an installed module
    Uninstall {
        /// Module name (ns/name)
        module: String,
    },

    /// Install a reference module from a declaration file
    InstallRef {
        /// Path to the reference declaration (TOML)
        declaration: PathBuf,
    },

    /// Run an installed module
    Run {
        /// Module name (ns/name or ns/name@version)
        module: String,

        /// Input passed to the module
        #[arg(short, long)]
        input: String,

        /// Run-time configuration overrides as JSON
        /// ({"tunables": {...}, "configurables": {...}})
        #[arg(short, long)]
        config: Option<String>,

        /// Run deadline in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// List installed modules
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store_root = cli
        .store_root
        .clone()
        .unwrap_or_else(ModuleStore::default_root);

    match cli.command {
        Commands::Init => init(),
        Commands::Sync => sync(&store_root).await,
        Commands::Package { module_dir, output } => package(&module_dir, output.as_deref()),
        Commands::Install { package } => install(&store_root, package.as_deref()).await,
        Commands::Uninstall { module } => uninstall(&store_root, &module).await,
        Commands::InstallRef { declaration } => install_ref(&store_root, &declaration).await,
        Commands::Run {
            module,
            input,
            config,
            timeout,
        } => run(&store_root, &module, &input, config.as_deref(), timeout).await,
        Commands::List => list(&store_root),
    }
}

fn open_store(root: &std::path::Path) -> Result<Arc<ModuleStore>> {
    let provider = Arc::new(ProcessEnvironmentProvider::new());
    let store = ModuleStore::open(root, provider)
        .with_context(|| format!("failed to open store at {}", root.display()))?;
    Ok(Arc::new(store))
}

fn init() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let path = ProjectConfig::scaffold(&cwd)?;
    println!("Initialized project: {}", path.display());
    println!("Edit it to declare module dependencies, then run `tether sync`.");
    Ok(())
}

async fn sync(store_root: &std::path::Path) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config = ProjectConfig::load(&cwd)
        .context("no project found; run `tether init` to create .tether/deps.toml")?;
    let store = open_store(store_root)?;
    let fetcher = registry_from_config(&config, &cwd);

    let report = tether_resolver::sync(&config, &cwd, &store, fetcher.as_ref()).await?;
    for coordinate in &report.installed {
        println!("installed  {coordinate}");
    }
    for coordinate in &report.skipped {
        println!("up-to-date {coordinate}");
    }
    for failure in &report.failed {
        eprintln!("failed     {}: {}", failure.coordinate, failure.error);
    }
    if !report.is_success() {
        bail!("{} of {} modules failed to resolve", report.failed.len(),
            report.installed.len() + report.skipped.len() + report.failed.len());
    }
    Ok(())
}

fn package(module_dir: &std::path::Path, output: Option<&std::path::Path>) -> Result<()> {
    let archive = PackageArchive::pack(module_dir)?;
    let out_dir = match output {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let path = archive.write_to(&out_dir)?;
    println!("Package created: {}", path.display());
    Ok(())
}

async fn install(store_root: &std::path::Path, package: Option<&std::path::Path>) -> Result<()> {
    let store = open_store(store_root)?;
    let archive = match package {
        Some(path) => PackageArchive::read_from(path)
            .with_context(|| format!("failed to read package {}", path.display()))?,
        // Directory mode: package the current directory and install it.
        None => {
            let cwd = std::env::current_dir()?;
            PackageArchive::pack(&cwd)
                .context("no package given and the current directory is not a module")?
        }
    };
    let installed = store.install(&archive).await?;
    println!("Installed {}", installed.coordinate());
    Ok(())
}

async fn uninstall(store_root: &std::path::Path, module: &str) -> Result<()> {
    let store = open_store(store_root)?;
    store.uninstall(module).await?;
    println!("Uninstalled {module}");
    Ok(())
}

async fn install_ref(store_root: &std::path::Path, declaration: &std::path::Path) -> Result<()> {
    let store = open_store(store_root)?;
    let declaration = ReferenceDeclaration::load(declaration)?;
    let installed = tether_resolver::install_reference(&store, &declaration).await?;
    println!(
        "Installed reference {} -> {}",
        installed.coordinate(),
        declaration.base_module
    );
    Ok(())
}

async fn run(
    store_root: &std::path::Path,
    module: &str,
    input: &str,
    config: Option<&str>,
    timeout: u64,
) -> Result<()> {
    let overrides: Option<ManifestOverrides> = config
        .map(serde_json::from_str)
        .transpose()
        .context("invalid --config JSON")?;

    let store = open_store(store_root)?;
    let engine = Engine::with_options(
        store,
        EngineOptions {
            timeout: Duration::from_secs(timeout),
            ..Default::default()
        },
    );
    let outcome = engine
        .run(module, serde_json::Value::String(input.to_string()), overrides.as_ref())
        .await?;

    match outcome.result {
        StepResult::Response { content } => {
            match content {
                serde_json::Value::String(s) => println!("{s}"),
                other => println!("{other}"),
            }
            Ok(())
        }
        StepResult::Error { kind, message } => bail!("module failed ({kind}): {message}"),
        StepResult::ToolCall { .. } => bail!("module ended on a non-terminal step"),
    }
}

fn list(store_root: &std::path::Path) -> Result<()> {
    let store = open_store(store_root)?;
    let entries = store.list()?;
    if entries.is_empty() {
        println!("No modules installed");
        return Ok(());
    }
    for entry in entries {
        let kind = if entry.is_reference() {
            match &entry.record.base {
                Some(base) => format!("reference -> {base}"),
                None => "reference".to_string(),
            }
        } else {
            entry.record.digest.clone().unwrap_or_default()
        };
        println!("{:<40} {}", entry.coordinate().to_string(), kind);
    }
    Ok(())
}
