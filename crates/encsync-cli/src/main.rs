//! encsync CLI - Command-line interface for encsync
//!
//! Provides commands for:
//! - Running sync targets through the staged pipeline
//! - Scanning folders into their filelists
//! - Planning the differences of a target
//! - Removing duplicate ciphertexts
//! - Inspecting the configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use encsync_core::config::Config;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    config::ConfigCommand, diff::DiffCommand, rmdup::RmdupCommand, scan::ScanCommand,
    sync::SyncCommand, GlobalArgs,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(
    name = "encsync",
    version,
    about = "Encrypted one-way synchronization between storages"
)]
pub struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Only print results and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Synchronize targets
    Sync(SyncCommand),
    /// Scan folders
    Scan(ScanCommand),
    /// Show the differences a target would apply
    Diff(DiffCommand),
    /// Remove duplicate ciphertexts of an encrypted folder
    Rmdup(RmdupCommand),
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// `-v` wins over the configured level; `-q` lowers it to warnings.
fn log_level(cli: &Cli, config_path: &std::path::Path) -> String {
    match cli.verbose {
        0 if cli.quiet => "warn".to_string(),
        0 => Config::load(config_path)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(&cli, &config_path)));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let global = GlobalArgs {
        config_path,
        format: OutputFormat::from_json_flag(cli.json),
        quiet: cli.quiet,
    };

    match &cli.command {
        Commands::Sync(cmd) => cmd.execute(&global).await,
        Commands::Scan(cmd) => cmd.execute(&global).await,
        Commands::Diff(cmd) => cmd.execute(&global).await,
        Commands::Rmdup(cmd) => cmd.execute(&global).await,
        Commands::Config(cmd) => cmd.execute(&global),
    }
}
