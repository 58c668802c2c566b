//! Module commands.
//!
//! Discover module descriptors on disk and inspect the resulting registry.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;

use modulith_core::config::Config;
use modulith_core::modules::{DiscoveryReport, ModuleRegistry};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ModulesCommands {
    /// Print the resolved initialization order
    Order(DirArgs),

    /// Validate every descriptor and the dependency graph
    Validate(DirArgs),

    /// Initialize descriptor-only modules and report their health
    Health(DirArgs),

    /// Show registry statistics
    Stats(DirArgs),
}

#[derive(Args)]
pub struct DirArgs {
    /// Modules directory (defaults to `modules.directory` from the configuration)
    #[arg(short, long)]
    dir: Option<PathBuf>,
}

// ── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Tabled)]
struct OrderRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Module")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Depends On")]
    dependencies: String,
}

#[derive(Debug, Serialize, Tabled)]
struct HealthRow {
    #[tabled(rename = "Module")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Config")]
    config_valid: String,
    #[tabled(rename = "Publishes")]
    published_events: usize,
    #[tabled(rename = "Subscribes")]
    subscriptions: usize,
    #[tabled(rename = "Services")]
    services: usize,
}

#[derive(Debug, Serialize)]
struct ValidationSummary {
    registered: Vec<String>,
    rejected: Vec<RejectedRow>,
    order: Option<Vec<String>>,
    graph_error: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct RejectedRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub fn execute(cmd: ModulesCommands, config: &Config, format: OutputFormat) -> Result<()> {
    match cmd {
        ModulesCommands::Order(args) => order(args, config, format),
        ModulesCommands::Validate(args) => validate(args, config, format),
        ModulesCommands::Health(args) => health(args, config, format),
        ModulesCommands::Stats(args) => stats(args, config, format),
    }
}

fn discover(args: &DirArgs, config: &Config) -> Result<(ModuleRegistry, DiscoveryReport)> {
    let dir = args.dir.clone().unwrap_or_else(|| config.modules.directory.clone());
    if !dir.is_dir() {
        bail!("modules directory '{}' does not exist", dir.display());
    }
    let mut registry = ModuleRegistry::new();
    let report = registry.discover(&dir, &config.modules.manifest_names)?;
    Ok((registry, report))
}

fn warn_rejected(report: &DiscoveryReport) {
    for rejected in &report.rejected {
        output::print_warning(&format!("{}: {}", rejected.path.display(), rejected.reason));
    }
}

fn order(args: DirArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let (mut registry, report) = discover(&args, config)?;
    warn_rejected(&report);

    let order = registry.resolve_initialization_order()?;
    let rows: Vec<OrderRow> = order
        .iter()
        .enumerate()
        .filter_map(|(i, name)| registry.get_module(name).map(|m| (i, m)))
        .map(|(i, module)| {
            let descriptor = module.descriptor();
            OrderRow {
                position: i + 1,
                name: descriptor.name.clone(),
                version: descriptor.version.clone(),
                dependencies: descriptor
                    .dependencies
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })
        .collect();

    output::print_list(&rows, format)
}

fn validate(args: DirArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let (mut registry, report) = discover(&args, config)?;
    let (order, graph_error) = match registry.resolve_initialization_order() {
        Ok(order) => (Some(order), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let summary = ValidationSummary {
        registered: report.registered,
        rejected: report
            .rejected
            .into_iter()
            .map(|r| RejectedRow {
                path: r.path.display().to_string(),
                reason: r.reason,
            })
            .collect(),
        order,
        graph_error,
    };
    let problems = summary.rejected.len() + usize::from(summary.graph_error.is_some());

    match format {
        OutputFormat::Table => {
            output::print_header("Module Validation");
            output::print_detail("Registered", &summary.registered.len().to_string());
            output::print_detail("Rejected", &summary.rejected.len().to_string());
            if let Some(order) = &summary.order {
                output::print_detail("Order", &order.join(" -> "));
            }
            if !summary.rejected.is_empty() {
                println!();
                output::print_list(&summary.rejected, format)?;
            }
            if let Some(e) = &summary.graph_error {
                output::print_error(e);
            }
        }
        _ => output::print_item(&summary, format)?,
    }

    if problems > 0 {
        bail!("{} problem(s) found", problems);
    }
    output::print_success("All modules valid");
    Ok(())
}

fn health(args: DirArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let (mut registry, report) = discover(&args, config)?;
    warn_rejected(&report);

    let init = registry.initialize_all()?;
    if let Some((module, reason)) = &init.failed {
        output::print_error(&format!("{} failed to initialize: {}", module, reason));
    }

    let health = registry.health_status();
    match format {
        OutputFormat::Table => {
            let rows: Vec<HealthRow> = health
                .into_iter()
                .map(|(name, h)| HealthRow {
                    name,
                    version: h.version,
                    state: h.state,
                    config_valid: if h.config_valid { "ok".into() } else { "invalid".into() },
                    published_events: h.published_events,
                    subscriptions: h.subscriptions,
                    services: h.services,
                })
                .collect();
            output::print_list(&rows, format)
        }
        _ => output::print_item(&health, format),
    }
}

fn stats(args: DirArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let (registry, report) = discover(&args, config)?;
    warn_rejected(&report);
    let stats = registry.statistics();

    match format {
        OutputFormat::Table => {
            output::print_header("Registry Statistics");
            output::print_detail("Total", &stats.total_modules.to_string());
            output::print_detail("Initialized", &stats.initialized.to_string());
            output::print_detail("Pending", &stats.pending.to_string());
            output::print_detail("Failed", &stats.failed.to_string());
            output::print_detail("Disabled", &stats.disabled.to_string());
            Ok(())
        }
        _ => output::print_item(&stats, format),
    }
}
