//! Contract tests shared by every event store backend.
//!
//! The in-memory store runs the whole suite. The PostgreSQL variants are
//! ignored by default; run them with `DATABASE_URL` set and `--ignored`.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use modulith_core::config::{EventStoreBackend, EventStoreConfig};
use modulith_core::events::{replay, Aggregate, DomainEvent, EventMetadata};
use modulith_core::store::{EventStore, InMemoryEventStore, PostgresEventStore, StoredEvent};
use serde_json::json;

fn order_event(name: &str, order: &str) -> DomainEvent {
    DomainEvent::from_value(name, json!({"order": order}))
        .unwrap()
        .with_aggregate(order, "Order")
}

async fn versions_start_at_one_and_increase(store: &dyn EventStore) {
    let meta = EventMetadata::new().with_actor("user-7").with_correlation("req-1");
    for name in ["order.placed", "order.paid", "order.shipped"] {
        store.store(&order_event(name, "order-1"), &meta).await.unwrap();
    }
    store.store(&order_event("order.placed", "order-2"), &meta).await.unwrap();

    let events = store.get_events_for_aggregate("order-1", None).await.unwrap();
    let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(events[0].event_type, "order.placed");
    assert_eq!(events[0].event_data, json!({"order": "order-1"}));

    let stored_meta = events[0].event_metadata().unwrap();
    assert_eq!(stored_meta.actor_id.as_deref(), Some("user-7"));
    assert_eq!(stored_meta.correlation_id.as_deref(), Some("req-1"));

    assert_eq!(store.get_aggregate_version("order-1", Some("Order")).await.unwrap(), 3);
    assert_eq!(store.get_aggregate_version("order-2", Some("Order")).await.unwrap(), 1);
    assert_eq!(store.get_aggregate_version("order-3", Some("Order")).await.unwrap(), 0);
    assert!(store.aggregate_exists("order-2", None).await.unwrap());
    assert!(!store.aggregate_exists("order-3", None).await.unwrap());
    assert_eq!(store.get_event_count().await.unwrap(), 4);
}

async fn events_from_version(store: &dyn EventStore) {
    let meta = EventMetadata::new();
    for i in 0..5 {
        store
            .store(&order_event(&format!("order.step{i}"), "order-9"), &meta)
            .await
            .unwrap();
    }
    let tail = store.get_events_from_version("order-9", 4, Some("Order")).await.unwrap();
    let versions: Vec<i64> = tail.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![4, 5]);
    assert!(store
        .get_events_from_version("order-9", 6, Some("Order"))
        .await
        .unwrap()
        .is_empty());
}

async fn type_and_date_queries(store: &dyn EventStore) {
    let meta = EventMetadata::new();
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    for (offset, name, order) in [(2, "order.placed", "a"), (0, "order.placed", "b"), (5, "order.paid", "a")] {
        let event = order_event(name, order).with_occurred_at(base + Duration::hours(offset));
        store.store(&event, &meta).await.unwrap();
    }

    let placed = store.get_events_by_type("order.placed").await.unwrap();
    let orders: Vec<&str> = placed.iter().map(|e| e.aggregate_id.as_str()).collect();
    assert_eq!(orders, vec!["b", "a"]);

    let window = store
        .get_events_by_date_range(base, base + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(window.len(), 2);
    assert_eq!(window[0].occurred_at, base);
    assert_eq!(window[1].occurred_at, base + Duration::hours(2));

    let bounded = window_bounds(store).await;
    assert_eq!(bounded, vec!["at-from", "inside"]);
}

/// Events just before, exactly at (with sub-microsecond digits) and inside a
/// window starting on a non-whole timestamp.
async fn window_bounds(store: &dyn EventStore) -> Vec<String> {
    let meta = EventMetadata::new();
    let from = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 15).unwrap() + Duration::nanoseconds(123_456_789);
    for (at, order) in [
        (from - Duration::microseconds(1), "before"),
        (from, "at-from"),
        (from + Duration::milliseconds(250), "inside"),
        (from + Duration::seconds(2), "after"),
    ] {
        let event = order_event("order.windowed", order).with_occurred_at(at);
        store.store(&event, &meta).await.unwrap();
    }

    store
        .get_events_by_date_range(from, from + Duration::seconds(1))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.aggregate_id)
        .collect()
}

async fn batch_and_pagination(store: &dyn EventStore) {
    let meta = EventMetadata::new();
    let batch = vec![
        order_event("order.placed", "x"),
        order_event("order.placed", "y"),
        order_event("order.paid", "x"),
    ];
    let stored = store.store_many(&batch, &meta).await.unwrap();
    let versions: Vec<(String, i64)> = stored.iter().map(|e| (e.aggregate_id.clone(), e.version)).collect();
    assert_eq!(
        versions,
        vec![("x".to_string(), 1), ("y".to_string(), 1), ("x".to_string(), 2)]
    );

    let first = store.get_events_paginated(0, 2).await.unwrap();
    let rest = store.get_events_paginated(2, 10).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(rest.len(), 1);
    assert!(first.iter().all(|e| rest.iter().all(|r| r.id != e.id)));

    store.clear().await.unwrap();
    assert_eq!(store.get_event_count().await.unwrap(), 0);
    assert_eq!(store.get_aggregate_version("x", Some("Order")).await.unwrap(), 0);
}

async fn concurrent_writers(store: Arc<dyn EventStore>) {
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                store
                    .store(&order_event("order.touched", "contended"), &EventMetadata::new())
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = store.get_events_for_aggregate("contended", Some("Order")).await.unwrap();
    let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, (1..=40).collect::<Vec<i64>>());
}

#[derive(Default)]
struct OrderSummary {
    steps: Vec<String>,
}

impl Aggregate for OrderSummary {
    fn apply(&mut self, event: &StoredEvent) {
        self.steps.push(event.event_type.clone());
    }
}

async fn replay_rebuilds_state(store: &dyn EventStore) {
    let meta = EventMetadata::new();
    for name in ["order.placed", "order.paid"] {
        store.store(&order_event(name, "r-1"), &meta).await.unwrap();
    }
    let (summary, version) = replay::<OrderSummary>(store, "r-1", Some("Order")).await.unwrap();
    assert_eq!(version, 2);
    assert_eq!(summary.steps, vec!["order.placed", "order.paid"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_memory_versions() {
    versions_start_at_one_and_increase(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_memory_from_version() {
    events_from_version(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_memory_type_and_date_queries() {
    type_and_date_queries(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_memory_batch_and_pagination() {
    batch_and_pagination(&InMemoryEventStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_writers() {
    concurrent_writers(Arc::new(InMemoryEventStore::new())).await;
}

#[tokio::test]
async fn test_memory_replay() {
    replay_rebuilds_state(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_connect_defaults_to_memory() {
    let store = modulith_core::store::connect(&EventStoreConfig::default()).await.unwrap();
    assert_eq!(store.backend_name(), "memory");
}

#[tokio::test]
async fn test_connect_postgres_requires_url() {
    let config = EventStoreConfig {
        backend: EventStoreBackend::Postgres,
        ..EventStoreConfig::default()
    };
    assert!(modulith_core::store::connect(&config).await.is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ─────────────────────────────────────────────────────────────────────────────

async fn postgres_store() -> PostgresEventStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for PostgreSQL tests");
    let config = EventStoreConfig {
        backend: EventStoreBackend::Postgres,
        url: Some(url),
        table: format!("event_store_test_{}", uuid::Uuid::new_v4().simple()),
        ..EventStoreConfig::default()
    };
    PostgresEventStore::from_config(&config).await.unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_versions() {
    versions_start_at_one_and_increase(&postgres_store().await).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_from_version() {
    events_from_version(&postgres_store().await).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_type_and_date_queries() {
    type_and_date_queries(&postgres_store().await).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_batch_and_pagination() {
    batch_and_pagination(&postgres_store().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_concurrent_writers() {
    concurrent_writers(Arc::new(postgres_store().await)).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_replay() {
    replay_rebuilds_state(&postgres_store().await).await;
}
