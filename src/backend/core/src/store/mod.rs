//! Append-only event log with per-aggregate versioning.
//!
//! Two interchangeable backends implement [`EventStore`]:
//!
//! - [`InMemoryEventStore`]: process-local, used in tests and single-node setups
//! - [`PostgresEventStore`]: durable, backed by one table
//!
//! For a fixed `(aggregate_id, aggregate_type)` the stored versions always
//! form the sequence `1, 2, 3, ...` with no gaps or duplicates, also under
//! concurrent writers.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{EventStoreBackend, EventStoreConfig};
use crate::events::{DomainEvent, EventMetadata};

// =============================================================================
// Stored Event
// =============================================================================

/// An immutable record of one persisted domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub metadata: serde_json::Value,
    /// Starts at 1, unique per aggregate.
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Build the record for `event` at `version`.
    ///
    /// Timestamps are truncated to microseconds, the precision PostgreSQL keeps.
    pub fn from_domain(
        event: &DomainEvent,
        version: i64,
        metadata: &EventMetadata,
        stored_at: DateTime<Utc>,
    ) -> Self {
        let (aggregate_id, aggregate_type) = event.aggregate_key();
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type,
            event_type: event.event_name().to_string(),
            event_data: serde_json::Value::Object(event.payload().clone()),
            metadata: metadata.to_value(),
            version,
            occurred_at: event.occurred_at().trunc_subsecs(6),
            stored_at: stored_at.trunc_subsecs(6),
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(&self.aggregate_id, &self.aggregate_type)
    }

    /// Deserialize the payload into a typed DTO.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, EventStoreError> {
        Ok(serde_json::from_value(self.event_data.clone())?)
    }

    /// Deserialize the stored metadata.
    pub fn event_metadata(&self) -> Result<EventMetadata, EventStoreError> {
        Ok(serde_json::from_value(self.metadata.clone())?)
    }
}

/// Identity of an aggregate's version sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub aggregate_id: String,
    pub aggregate_type: String,
}

impl AggregateKey {
    pub fn new(aggregate_id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
        }
    }

    pub fn of(event: &DomainEvent) -> Self {
        let (aggregate_id, aggregate_type) = event.aggregate_key();
        Self {
            aggregate_id,
            aggregate_type,
        }
    }

    pub fn matches(&self, aggregate_id: &str, aggregate_type: Option<&str>) -> bool {
        self.aggregate_id == aggregate_id
            && aggregate_type.map_or(true, |t| self.aggregate_type == t)
    }
}

impl std::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.aggregate_type, self.aggregate_id)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("Version conflict on {aggregate_type}:{aggregate_id} at version {version}")]
    VersionConflict {
        aggregate_id: String,
        aggregate_type: String,
        version: i64,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(String),
}

impl EventStoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

// =============================================================================
// Event Store Trait
// =============================================================================

/// Contract shared by every event store backend.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Short backend label for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Append one event at the next version of its aggregate.
    async fn store(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
    ) -> Result<StoredEvent, EventStoreError> {
        let mut stored = self.store_many(std::slice::from_ref(event), metadata).await?;
        stored
            .pop()
            .ok_or_else(|| EventStoreError::Schema("store_many returned no record".into()))
    }

    /// Append a batch atomically: either every event becomes visible or none does.
    ///
    /// Several events on one aggregate receive contiguous versions in batch order.
    async fn store_many(
        &self,
        events: &[DomainEvent],
        metadata: &EventMetadata,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// All events of an aggregate, ascending by version.
    ///
    /// Without a type, events of every aggregate type with this id are returned.
    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &str,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Events of an aggregate with `version >= from_version`, ascending by version.
    async fn get_events_from_version(
        &self,
        aggregate_id: &str,
        from_version: i64,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Events with this event type, ordered by occurrence then storage time.
    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Events with `from <= occurred_at <= to`, ordered by occurrence time.
    async fn get_events_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Current version of an aggregate; 0 when it has no events.
    async fn get_aggregate_version(
        &self,
        aggregate_id: &str,
        aggregate_type: Option<&str>,
    ) -> Result<i64, EventStoreError>;

    async fn aggregate_exists(
        &self,
        aggregate_id: &str,
        aggregate_type: Option<&str>,
    ) -> Result<bool, EventStoreError> {
        Ok(self.get_aggregate_version(aggregate_id, aggregate_type).await? > 0)
    }

    async fn get_event_count(&self) -> Result<u64, EventStoreError>;

    /// A page of events ordered by storage time, then id.
    async fn get_events_paginated(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Delete every event. Meant for tests and resets only.
    async fn clear(&self) -> Result<(), EventStoreError>;
}

/// Build the configured event store backend.
pub async fn connect(config: &EventStoreConfig) -> crate::Result<Arc<dyn EventStore>> {
    match config.backend {
        EventStoreBackend::Memory => Ok(Arc::new(InMemoryEventStore::new())),
        EventStoreBackend::Postgres => Ok(Arc::new(PostgresEventStore::from_config(config).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_domain_uses_aggregate_key() {
        let event = DomainEvent::from_value("order.placed", json!({"total": 10}))
            .unwrap()
            .with_aggregate("order-1", "Order");
        let metadata = EventMetadata::new().with_actor("user-1");
        let stored = StoredEvent::from_domain(&event, 3, &metadata, Utc::now());

        assert_eq!(stored.key(), AggregateKey::new("order-1", "Order"));
        assert_eq!(stored.event_type, "order.placed");
        assert_eq!(stored.version, 3);
        assert_eq!(stored.event_data, json!({"total": 10}));
        assert_eq!(stored.event_metadata().unwrap().actor_id.as_deref(), Some("user-1"));
        assert_eq!(stored.occurred_at, event.occurred_at().trunc_subsecs(6));
    }

    #[test]
    fn test_key_matching_with_optional_type() {
        let key = AggregateKey::new("order-1", "Order");
        assert!(key.matches("order-1", None));
        assert!(key.matches("order-1", Some("Order")));
        assert!(!key.matches("order-1", Some("Invoice")));
        assert!(!key.matches("order-2", None));
    }

    #[test]
    fn test_keys_sort_by_id_then_type() {
        let mut keys = vec![
            AggregateKey::new("b", "Order"),
            AggregateKey::new("a", "Order"),
            AggregateKey::new("a", "Invoice"),
        ];
        keys.sort();
        assert_eq!(keys[0], AggregateKey::new("a", "Invoice"));
        assert_eq!(keys[2], AggregateKey::new("b", "Order"));
    }
}
