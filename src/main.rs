//! chunkcache - maintenance CLI for the partial-file disk cache
//!
//! CLI entry point that dispatches to subcommands.

use chunkcache::cli::{commands, Cli, Commands};
use chunkcache::config::ConfigManager;
use chunkcache::error::CacheResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
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

async fn run() -> CacheResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Config commands load the file themselves so `path` and `init` work on a broken config
    if let Commands::Config(args) = cli.command {
        init_tracing(cli.verbose, "text");
        return commands::config(args, &config_manager).await;
    }

    let mut config = config_manager.load().await?;
    if let Some(profile) = cli.profile {
        config.general.profile = profile;
    }
    init_tracing(cli.verbose, &config.general.log_format);

    match cli.command {
        Commands::Config(_) => unreachable!("Config handled above"),
        Commands::Stats(args) => commands::stats(args, &config).await,
        Commands::Refresh(args) => commands::refresh(args, &config).await,
        Commands::Clear(args) => commands::clear(args, &config).await,
    }
}

/// Initialize logging: 0 = warn, 1 = info, 2+ = debug
fn init_tracing(verbose: u8, log_format: &str) {
    let filter = match verbose {
        0 => EnvFilter::new("chunkcache=warn"),
        1 => EnvFilter::new("chunkcache=info"),
        _ => EnvFilter::new("chunkcache=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
