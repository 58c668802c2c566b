//! Module-scoped publish/subscribe on top of the dispatcher.
//!
//! Modules never call each other directly; they publish events under their
//! own name and subscribe handlers on their own behalf. The bus keeps the
//! bookkeeping needed to audit that traffic: who published what, which
//! module subscribed to which events, and publications of events a module
//! never declared.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::dispatcher::{DispatchError, DispatchResult, EventDispatcher, EventListener, ListenerId};
use super::event::{DomainEvent, EventMetadata};
use crate::modules::ModuleDescriptor;
use crate::store::{EventStore, StoredEvent};

/// Number of recent publications kept for inspection.
pub const PUBLICATION_HISTORY: usize = 256;

/// One `publish` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicationRecord {
    pub source_module: String,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Cumulative bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStatistics {
    pub total_events_published: u64,
    pub total_subscriptions: u64,
    pub per_module_subscription_counts: BTreeMap<String, u64>,
    pub per_event_subscriber_counts: BTreeMap<String, u64>,
    pub per_module_publication_counts: BTreeMap<String, u64>,
    /// Publications of an event the publishing module did not declare.
    pub undeclared_publications: u64,
}

#[derive(Debug, Clone)]
struct Subscription {
    event_name: String,
    listener_id: ListenerId,
}

#[derive(Debug, Default)]
struct BusState {
    /// Module -> event names it declares as published.
    declarations: HashMap<String, BTreeSet<String>>,
    /// Module -> its live subscriptions.
    subscriptions: HashMap<String, Vec<Subscription>>,
    history: VecDeque<PublicationRecord>,
    stats: BusStatistics,
}

/// Module-aware event bus.
///
/// Cloning is cheap; clones share the dispatcher and the bookkeeping.
#[derive(Debug, Clone)]
pub struct ModuleEventBus {
    dispatcher: Arc<EventDispatcher>,
    default_priority: i32,
    state: Arc<Mutex<BusState>>,
}

impl ModuleEventBus {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            dispatcher,
            default_priority: 0,
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Create a bus that already knows what each module declares.
    pub fn with_declarations<'a, I>(dispatcher: Arc<EventDispatcher>, descriptors: I) -> Self
    where
        I: IntoIterator<Item = &'a ModuleDescriptor>,
    {
        let bus = Self::new(dispatcher);
        for descriptor in descriptors {
            bus.declare_module(descriptor);
        }
        bus
    }

    /// Priority used by [`subscribe`](Self::subscribe) when none is given.
    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Record the events `descriptor` declares as published.
    pub fn declare_module(&self, descriptor: &ModuleDescriptor) {
        let events: BTreeSet<String> = descriptor.published_events.keys().cloned().collect();
        debug!(module = %descriptor.name, events = events.len(), "Module publications declared");
        self.state.lock().declarations.insert(descriptor.name.clone(), events);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publish
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish `event` on behalf of `source_module`.
    ///
    /// Publishing an event the module did not declare is allowed but logged
    /// and counted. Modules that never declared anything are not audited.
    pub fn publish(&self, source_module: &str, event: &DomainEvent) -> Result<DispatchResult, DispatchError> {
        if source_module.trim().is_empty() {
            return Err(DispatchError::InvalidEvent("source module must not be empty".into()));
        }

        let event_name = event.event_name();
        {
            let mut state = self.state.lock();

            let undeclared = match state.declarations.get(source_module) {
                Some(declared) => !declared.contains(event_name),
                None => {
                    debug!(module = %source_module, "Publisher has no declarations, not audited");
                    false
                }
            };
            if undeclared {
                state.stats.undeclared_publications += 1;
                warn!(
                    module = %source_module,
                    event_name = %event_name,
                    "Module published an event it does not declare"
                );
            }

            state.stats.total_events_published += 1;
            *state
                .stats
                .per_module_publication_counts
                .entry(source_module.to_string())
                .or_insert(0) += 1;

            if state.history.len() == PUBLICATION_HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(PublicationRecord {
                source_module: source_module.to_string(),
                event_name: event_name.to_string(),
                timestamp: Utc::now(),
            });
        }

        debug!(module = %source_module, event_name = %event_name, "Publishing event");
        Ok(self.dispatcher.dispatch(event))
    }

    /// Publish, then append the event to `store`.
    ///
    /// Listener failures do not prevent the append; a store failure is returned.
    pub async fn publish_and_record(
        &self,
        source_module: &str,
        event: &DomainEvent,
        store: &dyn EventStore,
        metadata: &EventMetadata,
    ) -> crate::Result<(DispatchResult, StoredEvent)> {
        let dispatched = self.publish(source_module, event)?;
        let metadata = metadata
            .clone()
            .with_extra("source_module", source_module.to_string());
        let stored = store.store(event, &metadata).await?;
        Ok((dispatched, stored))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscribe
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe `listener` to each of `event_names` on behalf of `module`.
    ///
    /// Uses the bus default priority when `priority` is `None`.
    pub fn subscribe<I, S>(
        &self,
        module: &str,
        event_names: I,
        listener: Arc<dyn EventListener>,
        priority: Option<i32>,
    ) -> Result<Vec<ListenerId>, DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if module.trim().is_empty() {
            return Err(DispatchError::InvalidEvent("subscribing module must not be empty".into()));
        }
        let event_names: Vec<String> = event_names.into_iter().map(Into::into).collect();
        if event_names.iter().any(|name| name.trim().is_empty()) {
            return Err(DispatchError::InvalidEvent("event name must not be empty".into()));
        }

        let priority = priority.unwrap_or(self.default_priority);
        let mut ids = Vec::with_capacity(event_names.len());
        let mut subscriptions = Vec::with_capacity(event_names.len());

        for event_name in event_names {
            let id = self.dispatcher.add_module_listener(
                event_name.clone(),
                Arc::clone(&listener),
                priority,
                Some(module.to_string()),
            );
            ids.push(id);
            subscriptions.push(Subscription {
                event_name,
                listener_id: id,
            });
        }

        let mut state = self.state.lock();
        for subscription in &subscriptions {
            state.stats.total_subscriptions += 1;
            *state
                .stats
                .per_module_subscription_counts
                .entry(module.to_string())
                .or_insert(0) += 1;
            *state
                .stats
                .per_event_subscriber_counts
                .entry(subscription.event_name.clone())
                .or_insert(0) += 1;
        }
        info!(
            module = %module,
            events = ?subscriptions.iter().map(|s| s.event_name.as_str()).collect::<Vec<_>>(),
            priority,
            "Module subscribed"
        );
        state
            .subscriptions
            .entry(module.to_string())
            .or_default()
            .extend(subscriptions);

        Ok(ids)
    }

    /// Event names `module` currently listens to, sorted and deduplicated.
    pub fn subscriptions_of(&self, module: &str) -> Vec<String> {
        let state = self.state.lock();
        let names: BTreeSet<String> = state
            .subscriptions
            .get(module)
            .map(|subs| subs.iter().map(|s| s.event_name.clone()).collect())
            .unwrap_or_default();
        names.into_iter().collect()
    }

    /// Remove every listener `module` subscribed through the bus.
    ///
    /// Returns the number of listeners removed. Statistics are not rolled back.
    pub fn unsubscribe_module(&self, module: &str) -> usize {
        let subscriptions = self.state.lock().subscriptions.remove(module).unwrap_or_default();
        let removed = subscriptions
            .iter()
            .filter(|s| self.dispatcher.remove_listener(&s.event_name, s.listener_id))
            .count();
        info!(module = %module, removed, "Module unsubscribed");
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statistics
    // ─────────────────────────────────────────────────────────────────────────

    pub fn statistics(&self) -> BusStatistics {
        self.state.lock().stats.clone()
    }

    /// Most recent publications, oldest first, at most `limit`.
    pub fn recent_publications(&self, limit: usize) -> Vec<PublicationRecord> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Zero all counters and forget the publication history. Test hook.
    pub fn reset_statistics(&self) {
        let mut state = self.state.lock();
        state.stats = BusStatistics::default();
        state.history.clear();
    }
}
