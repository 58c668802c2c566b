//! Structured logging with JSON, pretty and compact formats.
//!
//! Every component logs through `tracing` macros with structured fields;
//! this module only decides where those records go and how they look.

use serde::Deserialize;
use std::collections::HashMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,

    /// Per-target log levels, e.g. `modulith_core::store = "debug"`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default = "default_include_location")]
    pub include_location: bool,

    /// Whether to include the target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,

    /// Whether to include thread ids and names
    #[serde(default)]
    pub include_thread: bool,

    /// Emit an event when an instrumented span closes
    #[serde(default)]
    pub log_span_close: bool,

    /// Write to stderr instead of stdout
    #[serde(default)]
    pub to_stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: default_include_location(),
            include_target: default_include_target(),
            include_thread: false,
            log_span_close: false,
            to_stderr: false,
        }
    }
}

impl LoggingConfig {
    /// Build the filter from the global level plus per-target overrides.
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)?;
        for (target, level) in &self.module_levels {
            filter = filter.add_directive(format!("{}={}", target, level).parse()?);
        }
        Ok(filter)
    }

    fn span_events(&self) -> FmtSpan {
        if self.log_span_close {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn writer(&self) -> BoxMakeWriter {
        if self.to_stderr {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::stdout)
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines for log shippers
    #[default]
    Json,
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    Compact,
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_include_location() -> bool {
    false
}

fn default_include_target() -> bool {
    true
}

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if the filter directives are malformed or a global
/// subscriber has already been installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = config.env_filter()?;

    match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_writer(config.writer())
                .with_span_events(config.span_events())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_writer(config.writer())
                .with_span_events(config.span_events())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_writer(config.writer())
                .with_span_events(config.span_events())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}
