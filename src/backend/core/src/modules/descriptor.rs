//! Module descriptor parsing and validation.
//!
//! A descriptor is the static metadata of one module: its identity, the
//! modules it depends on, its settings and the events it publishes and
//! subscribes to. Descriptors are plain data; they are usually kept next to
//! the module as `module.toml` or `module.json`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::OnceLock;

/// File names looked up by [`ModuleDescriptor::load_from_dir`], in order.
pub const DEFAULT_MANIFEST_NAMES: [&str; 2] = ["module.toml", "module.json"];

// ═══════════════════════════════════════════════════════════════════════════════
// ModuleDescriptor
// ═══════════════════════════════════════════════════════════════════════════════

/// Static metadata for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module name (e.g. "user", "order-history").
    pub name: String,

    /// Semantic version string.
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Names of modules that must be initialized before this one.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Free-form module settings.
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,

    /// Event names this module publishes, with a short description each.
    #[serde(default)]
    pub published_events: BTreeMap<String, String>,

    /// Event name -> label of the handler that reacts to it.
    #[serde(default)]
    pub subscriptions: BTreeMap<String, String>,

    /// Services this module exposes to the host.
    #[serde(default)]
    pub services: Vec<String>,

    /// Disabled modules are registered but never initialized.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ModuleDescriptor {
    /// Create a descriptor with only a name and version set.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            dependencies: BTreeSet::new(),
            settings: HashMap::new(),
            published_events: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            services: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, module: impl Into<String>) -> Self {
        self.dependencies.insert(module.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn publishes(mut self, event: impl Into<String>, description: impl Into<String>) -> Self {
        self.published_events.insert(event.into(), description.into());
        self
    }

    pub fn subscribes(mut self, event: impl Into<String>, handler: impl Into<String>) -> Self {
        self.subscriptions.insert(event.into(), handler.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Parsing helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Parse a descriptor from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, DescriptorError> {
        toml::from_str(toml_str).map_err(|e| DescriptorError::ParseError {
            format: "TOML".into(),
            details: e.to_string(),
        })
    }

    /// Parse a descriptor from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, DescriptorError> {
        serde_json::from_str(json_str).map_err(|e| DescriptorError::ParseError {
            format: "JSON".into(),
            details: e.to_string(),
        })
    }

    /// Parse a descriptor file, choosing the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DescriptorError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            other => Err(DescriptorError::ParseError {
                format: other.unwrap_or("unknown").to_string(),
                details: format!("unsupported descriptor file {}", path.display()),
            }),
        }
    }

    /// Load a descriptor from a directory, looking for `module.toml` then `module.json`.
    pub fn load_from_dir(dir: &Path) -> Result<Self, DescriptorError> {
        Self::load_with_names(dir, DEFAULT_MANIFEST_NAMES)
    }

    /// Load a descriptor from a directory, trying each file name in turn.
    pub fn load_with_names<I, S>(dir: &Path, names: I) -> Result<Self, DescriptorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let path = dir.join(name.as_ref());
            if path.is_file() {
                return Self::from_file(&path);
            }
        }

        Err(DescriptorError::NotFound {
            dir: dir.display().to_string(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    /// Collect every problem with this descriptor.
    ///
    /// An empty list means the descriptor is valid.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.name.trim().is_empty() {
            violations.push("name must not be empty".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            violations.push(format!(
                "name '{}' must contain only lowercase alphanumeric characters, '-' and '_'",
                self.name
            ));
        }

        if self.version.trim().is_empty() {
            violations.push("version must not be empty".to_string());
        } else if !semver_pattern().is_match(&self.version) {
            violations.push(format!(
                "version '{}' must follow semver (e.g. 1.0.0)",
                self.version
            ));
        }

        if self.dependencies.contains(&self.name) {
            violations.push(format!("module '{}' must not depend on itself", self.name));
        }

        if self.dependencies.iter().any(|d| d.trim().is_empty()) {
            violations.push("dependency names must not be blank".to_string());
        }

        if self.published_events.keys().any(|e| e.trim().is_empty()) {
            violations.push("published event names must not be blank".to_string());
        }

        if self.subscriptions.keys().any(|e| e.trim().is_empty()) {
            violations.push("subscribed event names must not be blank".to_string());
        }

        violations
    }

    /// Validate the descriptor, reporting all violations at once.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(DescriptorError::Invalid {
                module: self.name.clone(),
                violations,
            })
        }
    }

    /// Whether this module declares `event_name` as one it publishes.
    pub fn declares_event(&self, event_name: &str) -> bool {
        self.published_events.contains_key(event_name)
    }
}

fn semver_pattern() -> &'static Regex {
    static SEMVER: OnceLock<Regex> = OnceLock::new();
    SEMVER.get_or_init(|| {
        Regex::new(
            r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?(\+[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?$",
        )
        .expect("Invalid semver regex")
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors that can occur when working with module descriptors.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Descriptor not found in directory: {dir}")]
    NotFound { dir: String },

    #[error("Failed to parse {format} descriptor: {details}")]
    ParseError { format: String, details: String },

    #[error("Descriptor for module '{module}' is invalid: {}", violations.join("; "))]
    Invalid { module: String, violations: Vec<String> },

    #[error("IO error: {0}")]
    Io(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_descriptor() {
        let toml = r#"
name = "security"
version = "1.2.0"
description = "Authentication and authorization"
dependencies = ["user"]
services = ["authenticator"]

[settings]
session_ttl = 3600

[published_events]
"user.logged_in" = "A user completed login"

[subscriptions]
"user.registered" = "SendWelcomeMail"
"#;
        let descriptor = ModuleDescriptor::from_toml(toml).unwrap();
        assert_eq!(descriptor.name, "security");
        assert!(descriptor.dependencies.contains("user"));
        assert_eq!(descriptor.settings["session_ttl"], serde_json::json!(3600));
        assert!(descriptor.declares_event("user.logged_in"));
        assert_eq!(descriptor.subscriptions["user.registered"], "SendWelcomeMail");
        assert!(descriptor.enabled);
    }

    #[test]
    fn test_parse_json_descriptor() {
        let json = r#"{
            "name": "language",
            "version": "0.1.0",
            "enabled": false
        }"#;
        let descriptor = ModuleDescriptor::from_json(json).unwrap();
        assert_eq!(descriptor.name, "language");
        assert!(!descriptor.enabled);
        assert!(descriptor.dependencies.is_empty());
    }

    #[test]
    fn test_parse_error_names_format() {
        let err = ModuleDescriptor::from_toml("name = ").unwrap_err();
        assert!(matches!(err, DescriptorError::ParseError { ref format, .. } if format == "TOML"));
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let descriptor = ModuleDescriptor::new("Bad Name", "one.two")
            .depends_on("Bad Name")
            .depends_on(" ")
            .publishes("", "nameless");

        let violations = descriptor.violations();
        assert_eq!(violations.len(), 5, "{violations:?}");

        match descriptor.validate().unwrap_err() {
            DescriptorError::Invalid { module, violations } => {
                assert_eq!(module, "Bad Name");
                assert_eq!(violations.len(), 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_empty_fields() {
        let violations = ModuleDescriptor::new("", "").violations();
        assert_eq!(
            violations,
            vec!["name must not be empty", "version must not be empty"]
        );
    }

    #[test]
    fn test_semver_accepts_prerelease_and_build() {
        for version in ["1.0.0", "0.10.3", "2.0.0-rc.1", "1.0.0+build.5", "1.0.0-alpha+001"] {
            assert!(
                ModuleDescriptor::new("ok", version).validate().is_ok(),
                "{version} should be accepted"
            );
        }
        for version in ["1.0", "01.0.0", "1.0.0.0", "v1.0.0", "1.0.0-"] {
            assert!(
                ModuleDescriptor::new("ok", version).validate().is_err(),
                "{version} should be rejected"
            );
        }
    }

    #[test]
    fn test_load_from_dir_prefers_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("module.toml"), "name = \"from-toml\"\nversion = \"1.0.0\"").unwrap();
        std::fs::write(
            tmp.path().join("module.json"),
            r#"{"name": "from-json", "version": "1.0.0"}"#,
        )
        .unwrap();

        let descriptor = ModuleDescriptor::load_from_dir(tmp.path()).unwrap();
        assert_eq!(descriptor.name, "from-toml");
    }

    #[test]
    fn test_load_from_empty_dir_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = ModuleDescriptor::load_from_dir(tmp.path()).unwrap_err();
        assert!(matches!(err, DescriptorError::NotFound { .. }));
    }
}
