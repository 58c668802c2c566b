//! Modulith CLI - inspect module graphs and event stores.
//!
//! Provides module discovery, ordering, validation and health commands, and
//! read-only event store queries.

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{events, modules};
use modulith_core::config::Config;
use modulith_core::telemetry::{self, LogFormat};
use output::OutputFormat;

/// Modulith - module lifecycle and event communication engine
#[derive(Parser)]
#[command(
    name = "modulith",
    version,
    about = "Modulith - module lifecycle and event communication engine",
    long_about = "CLI tool for inspecting module descriptors, their initialization order, and stored events.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML, YAML or JSON); environment overrides use MODULITH__*
    #[arg(short, long, global = true, env = "MODULITH_CONFIG")]
    config: Option<String>,

    /// Log level for diagnostics written to stderr
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Module discovery and lifecycle inspection
    #[command(subcommand)]
    Modules(modules::ModulesCommands),

    /// Event store inspection
    #[command(subcommand)]
    Events(events::EventsCommands),
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    let mut logging = config.logging.clone();
    logging.level = cli.log_level.clone();
    logging.format = LogFormat::Compact;
    logging.to_stderr = true;
    telemetry::init_logging(&logging)?;
    tracing::debug!(config_file = ?cli.config, backend = ?config.event_store.backend, "Configuration loaded");

    let format = cli.output;
    match cli.command {
        Commands::Modules(cmd) => modules::execute(cmd, &config, format),
        Commands::Events(cmd) => events::execute(cmd, &config, format).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
