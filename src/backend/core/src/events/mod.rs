//! Event communication between modules.
//!
//! - **`event`**: the `DomainEvent` envelope, typed DTO support and metadata.
//! - **`dispatcher`**: synchronous, priority-ordered listener invocation with
//!   per-listener failure isolation.
//! - **`bus`**: module-scoped publish/subscribe and its audit statistics.
//! - **`aggregate`**: rebuilding aggregate state from an event store.

pub mod aggregate;
pub mod bus;
pub mod dispatcher;
pub mod event;

pub use aggregate::{replay, replay_from_version, Aggregate};
pub use bus::{BusStatistics, ModuleEventBus, PublicationRecord};
pub use dispatcher::{
    DispatchError, DispatchResult, EventDispatcher, EventListener, FnListener, ListenerError,
    ListenerFailure, ListenerId, ListenerInfo,
};
pub use event::{AggregateRef, DomainEvent, EventId, EventMetadata, TypedEvent, UNKNOWN_AGGREGATE_ID};
