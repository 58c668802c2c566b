//! Configuration management.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::LoggingConfig;

/// Prefix for environment overrides, e.g. `MODULITH__EVENT_STORE__URL`.
pub const ENV_PREFIX: &str = "MODULITH";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Module discovery configuration
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Event store configuration
    #[serde(default)]
    pub event_store: EventStoreConfig,

    /// Dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    /// Root directory scanned for module descriptors
    #[serde(default = "default_modules_directory")]
    pub directory: PathBuf,

    /// Descriptor file names looked up in each module directory, in order
    #[serde(default = "default_manifest_names")]
    pub manifest_names: Vec<String>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            directory: default_modules_directory(),
            manifest_names: default_manifest_names(),
        }
    }
}

/// Which event store implementation to use.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventStoreConfig {
    #[serde(default)]
    pub backend: EventStoreBackend,

    /// PostgreSQL connection URL (required for the postgres backend)
    #[serde(default)]
    pub url: Option<String>,

    /// Table holding stored events
    #[serde(default = "default_table")]
    pub table: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of pooled connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Retries of a write transaction after a version conflict
    #[serde(default = "default_max_version_retries")]
    pub max_version_retries: u32,

    /// Create the table and indexes on startup if missing
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            backend: EventStoreBackend::default(),
            url: None,
            table: default_table(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            max_version_retries: default_max_version_retries(),
            auto_create: default_auto_create(),
        }
    }
}

impl EventStoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatcherConfig {
    /// Priority used when a subscriber does not name one
    #[serde(default)]
    pub default_priority: i32,
}

// Default value functions
fn default_modules_directory() -> PathBuf { PathBuf::from("modules") }
fn default_manifest_names() -> Vec<String> { vec!["module.toml".to_string(), "module.json".to_string()] }
fn default_table() -> String { "event_store".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_acquire_timeout_secs() -> u64 { 5 }
fn default_max_version_retries() -> u32 { 3 }
fn default_auto_create() -> bool { true }

impl Config {
    /// Load configuration from environment variables only.
    pub fn load() -> crate::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load from a configuration file, with environment variables taking precedence.
    ///
    /// A missing file is treated as empty.
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.event_store.backend == EventStoreBackend::Postgres && self.event_store.url.is_none() {
            return Err(crate::ModulithError::new(
                crate::ErrorCode::MissingConfiguration,
                "event_store.url is required for the postgres backend",
            ));
        }
        if self.event_store.min_connections > self.event_store.max_connections {
            return Err(crate::ModulithError::new(
                crate::ErrorCode::InvalidConfiguration,
                "event_store.min_connections exceeds max_connections",
            ));
        }
        if !is_identifier(&self.event_store.table) {
            return Err(crate::ModulithError::new(
                crate::ErrorCode::InvalidConfiguration,
                format!("event_store.table '{}' is not a plain identifier", self.event_store.table),
            ));
        }
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is accepted.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_source_yields_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.event_store.backend, EventStoreBackend::Memory);
        assert_eq!(cfg.event_store.table, "event_store");
        assert_eq!(cfg.dispatcher.default_priority, 0);
        assert_eq!(cfg.modules.manifest_names, vec!["module.toml", "module.json"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_file_reads_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[modules]
directory = "app/modules"

[event_store]
backend = "postgres"
url = "postgres://localhost/modulith"
max_version_retries = 7

[dispatcher]
default_priority = 10
"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.modules.directory, PathBuf::from("app/modules"));
        assert_eq!(cfg.event_store.backend, EventStoreBackend::Postgres);
        assert_eq!(cfg.event_store.max_version_retries, 7);
        assert_eq!(cfg.dispatcher.default_priority, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_postgres_without_url_is_rejected() {
        let mut cfg = Config::default();
        cfg.event_store.backend = EventStoreBackend::Postgres;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::MissingConfiguration);
    }

    #[test]
    fn test_table_name_must_be_identifier() {
        assert!(is_identifier("event_store"));
        assert!(is_identifier("_events2"));
        assert!(!is_identifier("events; drop table x"));
        assert!(!is_identifier("2events"));
        assert!(!is_identifier(""));
    }
}
