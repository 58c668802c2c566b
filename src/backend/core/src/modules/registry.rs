//! Module registration, dependency resolution and initialization.
//!
//! The [`ModuleRegistry`] owns every module descriptor for the lifetime of
//! the process. It validates descriptors on registration, resolves a
//! dependency-respecting initialization order and runs each module's hook
//! once, in that order. Initialization is expected to run once, at boot.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::descriptor::{DescriptorError, ModuleDescriptor};
use super::graph::DependencyGraph;
use super::{Module, ModuleState};
use crate::events::dispatcher::panic_message;

// ═══════════════════════════════════════════════════════════════════════════════
// Registered Module
// ═══════════════════════════════════════════════════════════════════════════════

/// A module known to the registry.
pub struct RegisteredModule {
    descriptor: ModuleDescriptor,
    state: ModuleState,
    hook: Option<Arc<dyn Module>>,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RegisteredModule {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ModuleState::Initialized
    }

    pub fn has_hook(&self) -> bool {
        self.hook.is_some()
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_state(&mut self, state: ModuleState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

impl std::fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .field("has_hook", &self.hook.is_some())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of [`ModuleRegistry::initialize_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitializationReport {
    /// The resolved initialization order.
    pub order: Vec<String>,
    /// Modules initialized by this run.
    pub initialized: Vec<String>,
    /// The module whose hook failed, with the captured reason.
    pub failed: Option<(String, String)>,
    /// Modules not attempted because initialization halted or a dependency is not initialized.
    pub skipped: Vec<String>,
}

impl InitializationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none() && self.skipped.is_empty()
    }

    /// Turn a failed run into `RegistryError::InitializationFailed`.
    pub fn into_result(self) -> Result<Self, RegistryError> {
        match self.failed {
            Some((module, reason)) => Err(RegistryError::InitializationFailed { module, reason }),
            None => Ok(self),
        }
    }
}

/// A directory that did not yield a registered module during discovery.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedModule {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of [`ModuleRegistry::discover`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub registered: Vec<String>,
    pub rejected: Vec<RejectedModule>,
}

/// Health of one module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealth {
    pub version: String,
    pub state: String,
    pub initialized: bool,
    /// Descriptor valid and every dependency registered and enabled.
    pub config_valid: bool,
    pub services: usize,
    pub published_events: usize,
    pub subscriptions: usize,
    /// Whatever the module's hook reports from `health_check`.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

/// Totals across all registered modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatistics {
    pub total_modules: usize,
    pub initialized: usize,
    /// Registered or initializing.
    pub pending: usize,
    pub failed: usize,
    pub disabled: usize,
    pub by_state: BTreeMap<String, usize>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid configuration for module '{module}': {}", violations.join("; "))]
    ConfigInvalid { module: String, violations: Vec<String> },

    #[error("Module already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module '{module}' depends on '{missing}', which is not registered or is disabled")]
    MissingDependency { module: String, missing: String },

    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Module '{module}' failed to initialize: {reason}")]
    InitializationFailed { module: String, reason: String },

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Module Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns every module of the process and drives their initialization.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, RegisteredModule>,
    /// Names in registration order.
    registration_order: Vec<String>,
    /// Cleared whenever a module is registered.
    initialization_order: Option<Vec<String>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a module described only by its descriptor.
    ///
    /// Such a module initializes trivially.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), RegistryError> {
        self.insert(descriptor, None)
    }

    /// Register a module together with its runtime hook.
    pub fn register_with_hook(
        &mut self,
        descriptor: ModuleDescriptor,
        hook: Arc<dyn Module>,
    ) -> Result<(), RegistryError> {
        self.insert(descriptor, Some(hook))
    }

    fn insert(
        &mut self,
        descriptor: ModuleDescriptor,
        hook: Option<Arc<dyn Module>>,
    ) -> Result<(), RegistryError> {
        let mut violations = descriptor.violations();
        if let Some(hook) = &hook {
            if hook.name() != descriptor.name {
                violations.push(format!(
                    "hook name '{}' does not match descriptor name '{}'",
                    hook.name(),
                    descriptor.name
                ));
            }
        }

        if !violations.is_empty() {
            warn!(module = %descriptor.name, ?violations, "Rejecting invalid module descriptor");
            return Err(RegistryError::ConfigInvalid {
                module: descriptor.name,
                violations,
            });
        }

        if self.modules.contains_key(&descriptor.name) {
            return Err(RegistryError::AlreadyRegistered(descriptor.name));
        }

        let name = descriptor.name.clone();
        let state = if descriptor.enabled {
            ModuleState::Registered
        } else {
            ModuleState::Disabled
        };
        let now = Utc::now();

        info!(
            module = %name,
            version = %descriptor.version,
            dependencies = descriptor.dependencies.len(),
            enabled = descriptor.enabled,
            "Module registered"
        );

        self.modules.insert(
            name.clone(),
            RegisteredModule {
                descriptor,
                state,
                hook,
                registered_at: now,
                updated_at: now,
            },
        );
        self.registration_order.push(name);
        self.initialization_order = None;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Scan `dir` for module directories and register every valid descriptor.
    ///
    /// Subdirectories are visited in name order. Directories without a
    /// descriptor are ignored; unreadable, unparsable or invalid descriptors
    /// are logged and reported as rejected.
    pub fn discover(
        &mut self,
        dir: &Path,
        manifest_names: &[String],
    ) -> Result<DiscoveryReport, RegistryError> {
        let mut report = DiscoveryReport::default();

        if !dir.exists() {
            info!(dir = %dir.display(), "Modules directory does not exist, skipping discovery");
            return Ok(report);
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();

        for path in dirs {
            let descriptor = match ModuleDescriptor::load_with_names(&path, manifest_names) {
                Ok(descriptor) => descriptor,
                Err(DescriptorError::NotFound { .. }) => {
                    debug!(dir = %path.display(), "No module descriptor in directory");
                    continue;
                }
                Err(e) => {
                    warn!(module_dir = %path.display(), error = %e, "Failed to load module descriptor");
                    report.rejected.push(RejectedModule {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let name = descriptor.name.clone();
            match self.register(descriptor) {
                Ok(()) => report.registered.push(name),
                Err(e) => {
                    warn!(module_dir = %path.display(), error = %e, "Skipping module");
                    report.rejected.push(RejectedModule {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            registered = report.registered.len(),
            rejected = report.rejected.len(),
            "Module discovery complete"
        );
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dependency resolution
    // ─────────────────────────────────────────────────────────────────────────

    fn enabled_modules(&self) -> impl Iterator<Item = &RegisteredModule> {
        self.registration_order
            .iter()
            .filter_map(|name| self.modules.get(name))
            .filter(|m| m.descriptor.enabled)
    }

    /// Dependency graph of the enabled modules.
    pub fn dependency_graph(&self) -> Result<DependencyGraph, RegistryError> {
        DependencyGraph::build(
            self.enabled_modules()
                .map(|m| (m.descriptor.name.as_str(), &m.descriptor.dependencies)),
        )
    }

    /// Compute the order in which enabled modules must be initialized.
    ///
    /// Every dependency precedes its dependents; ties follow registration
    /// order. Fails on the first missing dependency or on a cycle, in which
    /// case no order is kept.
    pub fn resolve_initialization_order(&mut self) -> Result<Vec<String>, RegistryError> {
        self.initialization_order = None;
        let order = self.dependency_graph()?.topological_order()?;
        debug!(?order, "Resolved module initialization order");
        self.initialization_order = Some(order.clone());
        Ok(order)
    }

    /// The last successfully resolved order.
    ///
    /// Registering a module invalidates it, so this is `None` until the next
    /// [`resolve_initialization_order`](Self::resolve_initialization_order)
    /// or [`initialize_all`](Self::initialize_all) recomputes it.
    pub fn initialization_order(&self) -> Option<&[String]> {
        self.initialization_order.as_deref()
    }

    /// Every module that transitively depends on `name`.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        if !self.modules.contains_key(name) {
            return Err(RegistryError::ModuleNotFound(name.to_string()));
        }
        let graph = DependencyGraph::build_lenient(
            self.registration_order
                .iter()
                .filter_map(|n| self.modules.get(n))
                .map(|m| (m.descriptor.name.as_str(), &m.descriptor.dependencies)),
        );
        Ok(graph.dependents_of(name))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Initialize every module still in `Registered` state, in dependency order.
    ///
    /// A missing dependency or a cycle fails the whole run before any hook
    /// is called. A failing hook marks its module `Failed` and halts the
    /// run; modules initialized earlier stay initialized and the remaining
    /// ones are reported as skipped. A later call retries only modules
    /// that are still `Registered` and whose dependencies are initialized.
    pub fn initialize_all(&mut self) -> Result<InitializationReport, RegistryError> {
        let order = match self.resolve_initialization_order() {
            Ok(order) => order,
            Err(e) => {
                error!(error = %e, "Module initialization aborted");
                return Err(e);
            }
        };

        let mut report = InitializationReport {
            order: order.clone(),
            ..InitializationReport::default()
        };

        for name in &order {
            let Some(module) = self.modules.get(name) else {
                continue;
            };
            if module.state != ModuleState::Registered {
                continue;
            }

            if report.failed.is_some() {
                report.skipped.push(name.clone());
                continue;
            }

            let blocked_by = module
                .descriptor
                .dependencies
                .iter()
                .find(|dep| !self.is_initialized(dep))
                .cloned();
            if let Some(dependency) = blocked_by {
                debug!(module = %name, dependency = %dependency, "Dependency not initialized, skipping");
                report.skipped.push(name.clone());
                continue;
            }

            let hook = module.hook.clone();
            if let Some(module) = self.modules.get_mut(name) {
                module.set_state(ModuleState::Initializing);
            }

            let outcome = match hook {
                Some(hook) => match catch_unwind(AssertUnwindSafe(|| hook.initialize())) {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
                },
                None => Ok(()),
            };

            match outcome {
                Ok(()) => {
                    if let Some(module) = self.modules.get_mut(name) {
                        module.set_state(ModuleState::Initialized);
                    }
                    info!(module = %name, "Module initialized");
                    report.initialized.push(name.clone());
                }
                Err(reason) => {
                    if let Some(module) = self.modules.get_mut(name) {
                        module.set_state(ModuleState::Failed(reason.clone()));
                    }
                    let dependents = self.dependents_of(name).unwrap_or_default();
                    error!(
                        module = %name,
                        reason = %reason,
                        ?dependents,
                        "Module initialization failed, halting"
                    );
                    report.failed = Some((name.clone(), reason));
                }
            }
        }

        if report.failed.is_none() {
            info!(
                initialized = report.initialized.len(),
                skipped = report.skipped.len(),
                "Module initialization complete"
            );
        } else {
            warn!(skipped = ?report.skipped, "Modules skipped after initialization failure");
        }
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_module(&self, name: &str) -> Option<&RegisteredModule> {
        self.modules.get(name)
    }

    /// Like [`get_module`](Self::get_module) but with a typed error.
    pub fn module(&self, name: &str) -> Result<&RegisteredModule, RegistryError> {
        self.modules
            .get(name)
            .ok_or_else(|| RegistryError::ModuleNotFound(name.to_string()))
    }

    pub fn is_initialized(&self, name: &str) -> bool {
        self.modules.get(name).is_some_and(|m| m.is_initialized())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Module names in registration order.
    pub fn modules(&self) -> Vec<&str> {
        self.registration_order.iter().map(String::as_str).collect()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.registration_order
            .iter()
            .filter_map(|name| self.modules.get(name))
            .map(|m| &m.descriptor)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Per-module health, keyed by name.
    pub fn health_status(&self) -> BTreeMap<String, ModuleHealth> {
        self.modules
            .values()
            .map(|m| {
                let dependencies_resolvable = m.descriptor.dependencies.iter().all(|dep| {
                    self.modules
                        .get(dep)
                        .is_some_and(|d| d.descriptor.enabled)
                });
                let details = m
                    .hook
                    .as_ref()
                    .map(|hook| hook.health_check())
                    .unwrap_or_default();

                let health = ModuleHealth {
                    version: m.descriptor.version.clone(),
                    state: m.state.to_string(),
                    initialized: m.is_initialized(),
                    config_valid: m.descriptor.violations().is_empty() && dependencies_resolvable,
                    services: m.descriptor.services.len(),
                    published_events: m.descriptor.published_events.len(),
                    subscriptions: m.descriptor.subscriptions.len(),
                    details,
                };
                (m.descriptor.name.clone(), health)
            })
            .collect()
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics {
            total_modules: self.modules.len(),
            ..RegistryStatistics::default()
        };

        for module in self.modules.values() {
            match module.state {
                ModuleState::Initialized => stats.initialized += 1,
                ModuleState::Registered | ModuleState::Initializing => stats.pending += 1,
                ModuleState::Failed(_) => stats.failed += 1,
                ModuleState::Disabled => stats.disabled += 1,
            }
            *stats
                .by_state
                .entry(module.state.label().to_string())
                .or_insert(0) += 1;
        }

        stats
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
