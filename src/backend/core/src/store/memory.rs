//! Process-local event store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use tokio::sync::{Mutex, RwLock as GateLock};
use tracing::{debug, instrument};

use super::{AggregateKey, EventStore, EventStoreError, StoredEvent};
use crate::events::{DomainEvent, EventMetadata};

/// In-memory [`EventStore`].
///
/// Version assignment for an aggregate runs under that aggregate's mutex;
/// batches take their locks in sorted key order and build every record
/// before any of them becomes visible. Writers share `gate`; [`clear`]
/// holds it exclusively.
///
/// [`clear`]: EventStore::clear
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    /// Records in storage order.
    events: RwLock<Vec<StoredEvent>>,
    versions: DashMap<AggregateKey, i64>,
    locks: DashMap<AggregateKey, Arc<Mutex<()>>>,
    gate: GateLock<()>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &AggregateKey) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key.clone()).or_default().value())
    }

    fn current_version(&self, key: &AggregateKey) -> i64 {
        self.versions.get(key).map_or(0, |v| *v)
    }

    fn select<F>(&self, filter: F) -> Vec<StoredEvent>
    where
        F: Fn(&StoredEvent) -> bool,
    {
        self.events
            .read()
            .iter()
            .filter(|e| filter(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, events, metadata), fields(batch = events.len()))]
    async fn store_many(
        &self,
        events: &[DomainEvent],
        metadata: &EventMetadata,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let _gate = self.gate.read().await;
        let keys: BTreeSet<AggregateKey> = events.iter().map(AggregateKey::of).collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock_for(key).lock_owned().await);
        }

        let mut next: HashMap<AggregateKey, i64> =
            keys.iter().map(|k| (k.clone(), self.current_version(k))).collect();
        let stored_at = Utc::now();

        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let key = AggregateKey::of(event);
            let version = next.entry(key).or_insert(0);
            *version += 1;
            records.push(StoredEvent::from_domain(event, *version, metadata, stored_at));
        }

        {
            let mut log = self.events.write();
            log.extend(records.iter().cloned());
            for (key, version) in next {
                self.versions.insert(key, version);
            }
        }
        drop(guards);

        counter!("modulith_events_stored_total", "backend" => "memory").increment(records.len() as u64);
        debug!(count = records.len(), "Events stored");
        Ok(records)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &str,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut events = self.select(|e| e.key().matches(aggregate_id, aggregate_type));
        events.sort_by(|a, b| a.version.cmp(&b.version).then(a.stored_at.cmp(&b.stored_at)));
        Ok(events)
    }

    async fn get_events_from_version(
        &self,
        aggregate_id: &str,
        from_version: i64,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut events = self.get_events_for_aggregate(aggregate_id, aggregate_type).await?;
        events.retain(|e| e.version >= from_version);
        Ok(events)
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut events = self.select(|e| e.event_type == event_type);
        events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.stored_at.cmp(&b.stored_at)));
        Ok(events)
    }

    async fn get_events_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        // Stored timestamps carry microseconds; compare at the same precision.
        let (from, to) = (from.trunc_subsecs(6), to.trunc_subsecs(6));
        let mut events = self.select(|e| e.occurred_at >= from && e.occurred_at <= to);
        events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.stored_at.cmp(&b.stored_at)));
        Ok(events)
    }

    async fn get_aggregate_version(
        &self,
        aggregate_id: &str,
        aggregate_type: Option<&str>,
    ) -> Result<i64, EventStoreError> {
        let version = match aggregate_type {
            Some(t) => self.current_version(&AggregateKey::new(aggregate_id, t)),
            None => self
                .versions
                .iter()
                .filter(|entry| entry.key().aggregate_id == aggregate_id)
                .map(|entry| *entry.value())
                .max()
                .unwrap_or(0),
        };
        Ok(version)
    }

    async fn get_event_count(&self) -> Result<u64, EventStoreError> {
        Ok(self.events.read().len() as u64)
    }

    async fn get_events_paginated(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut events = self.select(|_| true);
        events.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then(a.id.cmp(&b.id)));
        Ok(events
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn clear(&self) -> Result<(), EventStoreError> {
        let _gate = self.gate.write().await;
        self.events.write().clear();
        self.versions.clear();
        self.locks.clear();
        debug!("Event store cleared");
        Ok(())
    }
}
