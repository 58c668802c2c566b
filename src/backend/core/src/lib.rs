#![allow(clippy::result_large_err)]
//! # Modulith Core
//!
//! Lifecycle and event communication for a modular monolith.
//!
//! ## Architecture
//!
//! - **Modules**: descriptors, dependency-ordered initialization and health
//! - **Dispatcher**: synchronous, priority-ordered listener invocation
//! - **Event Bus**: module-scoped publish/subscribe with audit statistics
//! - **Event Store**: append-only log with per-aggregate versioning, in memory or in PostgreSQL
//! - **Telemetry**: structured logging setup

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod modules;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, ModulithError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, EventStoreBackend, EventStoreConfig};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, ModulithError, Result};
    pub use crate::events::{
        replay, replay_from_version, Aggregate, AggregateRef, BusStatistics, DispatchError,
        DispatchResult, DomainEvent, EventDispatcher, EventListener, EventMetadata, FnListener,
        ListenerError, ListenerId, ModuleEventBus, TypedEvent,
    };
    pub use crate::modules::{
        InitializationReport, Module, ModuleDescriptor, ModuleHookError, ModuleRegistry,
        ModuleState, RegistryError,
    };
    pub use crate::store::{
        AggregateKey, EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore,
        StoredEvent,
    };
    pub use crate::telemetry::{init_logging, LogFormat, LoggingConfig};
}
