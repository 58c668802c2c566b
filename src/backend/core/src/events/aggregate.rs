//! Aggregate state reconstruction from stored events.
//!
//! An aggregate starts at its `Default` state and folds each of its stored
//! events in version order. The same event stream always yields the same state.

use tracing::debug;

use crate::store::{EventStore, EventStoreError, StoredEvent};

/// State that can be rebuilt from an aggregate's event stream.
pub trait Aggregate: Default {
    /// Fold one event into the state.
    ///
    /// Must not perform I/O or fail; events it does not care about are ignored.
    fn apply(&mut self, event: &StoredEvent);
}

/// Rebuild `A` from every event of the aggregate.
///
/// Returns the state and the version of the last applied event (0 when the
/// aggregate has no events).
pub async fn replay<A: Aggregate>(
    store: &dyn EventStore,
    aggregate_id: &str,
    aggregate_type: Option<&str>,
) -> Result<(A, i64), EventStoreError> {
    let events = store.get_events_for_aggregate(aggregate_id, aggregate_type).await?;
    Ok(fold(A::default(), &events, 0, aggregate_id))
}

/// Continue folding `state` with events at `from_version` and later.
///
/// Used to bring a snapshot up to date; `from_version` is usually the
/// snapshot version plus one.
pub async fn replay_from_version<A: Aggregate>(
    store: &dyn EventStore,
    state: A,
    aggregate_id: &str,
    from_version: i64,
    aggregate_type: Option<&str>,
) -> Result<(A, i64), EventStoreError> {
    let events = store
        .get_events_from_version(aggregate_id, from_version, aggregate_type)
        .await?;
    let mut base = from_version.saturating_sub(1).max(0);
    if events.is_empty() {
        base = base.min(store.get_aggregate_version(aggregate_id, aggregate_type).await?);
    }
    Ok(fold(state, &events, base, aggregate_id))
}

fn fold<A: Aggregate>(mut state: A, events: &[StoredEvent], base: i64, aggregate_id: &str) -> (A, i64) {
    let mut version = base;
    for event in events {
        state.apply(event);
        version = version.max(event.version);
    }
    debug!(aggregate_id = %aggregate_id, applied = events.len(), version, "Aggregate replayed");
    (state, version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DomainEvent, EventMetadata};
    use crate::store::InMemoryEventStore;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Account {
        balance: i64,
        closed: bool,
        seen: Vec<i64>,
    }

    impl Aggregate for Account {
        fn apply(&mut self, event: &StoredEvent) {
            self.seen.push(event.version);
            let amount = event.event_data.get("amount").and_then(|v| v.as_i64()).unwrap_or(0);
            match event.event_type.as_str() {
                "account.deposited" => self.balance += amount,
                "account.withdrawn" => self.balance -= amount,
                "account.closed" => self.closed = true,
                _ => {}
            }
        }
    }

    fn account_event(name: &str, amount: i64) -> DomainEvent {
        DomainEvent::from_value(name, json!({"amount": amount}))
            .unwrap()
            .with_aggregate("acc-1", "Account")
    }

    async fn seeded() -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        let batch = vec![
            account_event("account.deposited", 100),
            account_event("account.withdrawn", 30),
            account_event("account.deposited", 5),
            account_event("account.closed", 0),
        ];
        store.store_many(&batch, &EventMetadata::new()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_replay_folds_in_version_order() {
        let store = seeded().await;
        let (account, version) = replay::<Account>(&store, "acc-1", Some("Account")).await.unwrap();

        assert_eq!(version, 4);
        assert_eq!(account.balance, 75);
        assert!(account.closed);
        assert_eq!(account.seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_replay_of_unknown_aggregate_is_default() {
        let store = InMemoryEventStore::new();
        let (account, version) = replay::<Account>(&store, "missing", None).await.unwrap();
        assert_eq!(version, 0);
        assert_eq!(account.balance, 0);
    }

    #[tokio::test]
    async fn test_replay_from_version_continues_snapshot() {
        let store = seeded().await;
        let snapshot = Account {
            balance: 70,
            closed: false,
            seen: vec![1, 2],
        };
        let (account, version) = replay_from_version(&store, snapshot, "acc-1", 3, Some("Account"))
            .await
            .unwrap();

        assert_eq!(version, 4);
        assert_eq!(account.balance, 75);
        assert_eq!(account.seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_replay_from_version_past_end_keeps_state() {
        let store = seeded().await;
        let (account, version) = replay_from_version(&store, Account::default(), "acc-1", 10, None)
            .await
            .unwrap();
        assert_eq!(version, 4);
        assert!(account.seen.is_empty());
    }
}
