//! Module system: descriptors, dependency resolution and lifecycle.
//!
//! Modules are independently described units of functionality. The
//! [`ModuleRegistry`] holds their descriptors, resolves a safe
//! initialization order and drives each module's [`Module`] hook exactly
//! once. At runtime modules talk to each other only through the
//! [`crate::events::ModuleEventBus`].

pub mod descriptor;
pub mod graph;
pub mod registry;

pub use descriptor::{DescriptorError, ModuleDescriptor, DEFAULT_MANIFEST_NAMES};
pub use graph::DependencyGraph;
pub use registry::{
    DiscoveryReport, InitializationReport, ModuleHealth, ModuleRegistry, RegisteredModule,
    RegistryError, RegistryStatistics,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ═══════════════════════════════════════════════════════════════════════════════
// Module State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a module inside the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Known to the registry, not yet initialized.
    Registered,
    /// The initialization hook is running.
    Initializing,
    /// The initialization hook completed successfully.
    Initialized,
    /// The initialization hook failed with the captured reason.
    Failed(String),
    /// Descriptor has `enabled = false`; never initialized.
    Disabled,
}

impl ModuleState {
    /// Short label used for grouping in statistics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Failed(_) => "failed",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Module Hook
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a module's initialization hook.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ModuleHookError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ModuleHookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Runtime behavior of a module.
///
/// `initialize` is called exactly once by the registry, after every
/// dependency of the module initialized successfully.
pub trait Module: Send + Sync {
    /// Must match the name in the module's descriptor.
    fn name(&self) -> &str;

    fn initialize(&self) -> Result<(), ModuleHookError>;

    /// Free-form health details reported by the registry.
    fn health_check(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }
}
