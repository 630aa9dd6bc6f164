//! Command-line driver for the firmament synchronizer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use firmament_core::{Config, Server};

/// Content-addressed multi-backend file synchronizer
#[derive(Parser)]
#[command(name = "firmament")]
#[command(author, version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory inside the checkout to operate on
    #[arg(short, long, default_value = ".", global = true)]
    directory: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation server until interrupted
    Server,

    /// Inspect the local datastores
    #[command(subcommand)]
    Debug(DebugCommands),
}

#[derive(Subcommand)]
enum DebugCommands {
    /// List the global file-version history
    FileVersions,

    /// List this checkout's on-disk file records
    LocalVersions,
}

fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "info",
        1 => "firmament_core=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(directory: &Path) -> Result<Config> {
    let root = Config::discover(directory)
        .with_context(|| format!("while looking for a checkout from {}", directory.display()))?;
    Config::load(&root).with_context(|| format!("while loading checkout {}", root.display()))
}

fn run_server(config: Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("while installing the interrupt handler")?;

    Server::new(Arc::new(config))
        .run(&shutdown)
        .context("while running the server")?;
    Ok(())
}

fn debug_file_versions(config: &Config) -> Result<()> {
    for (path, versions) in config.file_versions.all()? {
        println!("{path}");
        for (content_hash, meta) in versions {
            println!("    {content_hash} mtime={} size={}", meta.mtime, meta.size);
        }
    }
    Ok(())
}

fn debug_local_versions(config: &Config) -> Result<()> {
    for (path, data) in config.local_versions.items()? {
        let hash = data.content_hash.as_deref().unwrap_or("<unhashed>");
        println!(
            "{path} {hash} mtime={} size={}",
            data.mtime, data.size
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli.directory)?;
    match cli.command {
        Commands::Server => run_server(config),
        Commands::Debug(DebugCommands::FileVersions) => debug_file_versions(&config),
        Commands::Debug(DebugCommands::LocalVersions) => debug_local_versions(&config),
    }
}
