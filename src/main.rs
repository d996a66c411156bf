//! topocache - hardware topology detection for HPC partitions
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use topocache::cli::{Cli, Commands};
use topocache::config::ConfigManager;
use topocache::error::TopoResult;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> TopoResult<()> {
    let cli = Cli::parse();

    // Probe jobs run on compute nodes and must not depend on a config file
    if let Commands::Probe(args) = cli.command {
        init_logging(cli.verbose, false);
        return topocache::cli::commands::probe(args).await;
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;
    init_logging(cli.verbose, config.general.log_format == "json");
    debug!("Using configuration {}", config_manager.path().display());

    let topology_dir = cli.topology_dir.as_deref();

    match cli.command {
        Commands::Probe(_) => unreachable!("Probe handled above"),
        Commands::Detect(args) => {
            topocache::cli::commands::detect(args, &config, topology_dir).await
        }
        Commands::Show(args) => topocache::cli::commands::show(args, &config, topology_dir).await,
        Commands::Cache(args) => {
            topocache::cli::commands::cache(args, &config, topology_dir).await
        }
        Commands::Config(args) => {
            topocache::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

/// Logs go to stderr; stdout carries reports
fn init_logging(verbose: u8, json: bool) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("topocache=warn"),
        1 => EnvFilter::new("topocache=info"),
        _ => EnvFilter::new("topocache=debug"),
    };

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
}
