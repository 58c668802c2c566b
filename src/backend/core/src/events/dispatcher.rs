//! Synchronous, priority-ordered event dispatch.
//!
//! The dispatcher maps an event name to an ordered list of listeners and
//! invokes them one after another on the caller's thread. A failing or
//! panicking listener is logged and counted; it never stops the remaining
//! listeners and never surfaces as an error to the publisher.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::event::DomainEvent;

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Misuse of the dispatch API. Listener failures are never reported this way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
}

/// Error returned by a listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{0}")]
    Failed(String),

    #[error("listener panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ListenerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Listeners
// ═══════════════════════════════════════════════════════════════════════════════

/// Something that reacts to domain events.
pub trait EventListener: Send + Sync {
    fn handle(&self, event: &DomainEvent) -> Result<(), ListenerError>;

    /// Label used in logs and dispatch results.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapts a closure into an [`EventListener`].
pub struct FnListener<F> {
    name: String,
    handler: F,
}

impl<F> FnListener<F>
where
    F: Fn(&DomainEvent) -> Result<(), ListenerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&DomainEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn handle(&self, event: &DomainEvent) -> Result<(), ListenerError> {
        (self.handler)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle returned by [`EventDispatcher::add_listener`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Clone)]
struct ListenerRegistration {
    id: ListenerId,
    listener: Arc<dyn EventListener>,
    priority: i32,
    source_module: Option<String>,
}

/// Read-only view of a registered listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    pub id: ListenerId,
    pub name: String,
    pub priority: i32,
    pub source_module: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch Result
// ═══════════════════════════════════════════════════════════════════════════════

/// A listener invocation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerFailure {
    pub listener_id: ListenerId,
    pub listener: String,
    pub error: String,
}

/// Summary of one [`EventDispatcher::dispatch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub event_name: String,
    pub listeners_invoked: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub failures: Vec<ListenerFailure>,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        self.error_count == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Event name -> listeners, highest priority first.
///
/// Equal priorities keep registration order. Listeners are expected to be
/// registered at boot; dispatch works on a snapshot so a listener may
/// register or dispatch re-entrantly without deadlocking.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<HashMap<String, Vec<ListenerRegistration>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event_name`.
    pub fn add_listener(
        &self,
        event_name: impl Into<String>,
        listener: Arc<dyn EventListener>,
        priority: i32,
    ) -> ListenerId {
        self.add_module_listener(event_name, listener, priority, None)
    }

    /// Register a closure as a listener for `event_name`.
    pub fn on<F>(&self, event_name: impl Into<String>, name: impl Into<String>, priority: i32, handler: F) -> ListenerId
    where
        F: Fn(&DomainEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.add_listener(event_name, Arc::new(FnListener::new(name, handler)), priority)
    }

    /// Register a listener owned by `source_module`.
    pub fn add_module_listener(
        &self,
        event_name: impl Into<String>,
        listener: Arc<dyn EventListener>,
        priority: i32,
        source_module: Option<String>,
    ) -> ListenerId {
        let event_name = event_name.into();
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        debug!(
            event_name = %event_name,
            listener = listener.name(),
            priority,
            source_module = ?source_module,
            "Listener registered"
        );

        let mut listeners = self.listeners.write();
        let list = listeners.entry(event_name).or_default();
        // Insert after every listener of greater or equal priority.
        let position = list.partition_point(|r| r.priority >= priority);
        list.insert(
            position,
            ListenerRegistration {
                id,
                listener,
                priority,
                source_module,
            },
        );
        id
    }

    /// Remove one listener. Returns whether it was registered.
    pub fn remove_listener(&self, event_name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event_name) else {
            return false;
        };

        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(event_name);
        }
        removed
    }

    /// Remove every listener registered on behalf of `module`.
    ///
    /// Returns the number removed.
    pub fn remove_module_listeners(&self, module: &str) -> usize {
        let mut listeners = self.listeners.write();
        let mut removed = 0;
        listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.source_module.as_deref() != Some(module));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub fn has_listeners(&self, event_name: &str) -> bool {
        self.listeners
            .read()
            .get(event_name)
            .is_some_and(|list| !list.is_empty())
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners.read().get(event_name).map_or(0, Vec::len)
    }

    /// Listeners for `event_name` in invocation order.
    pub fn listeners(&self, event_name: &str) -> Vec<ListenerInfo> {
        self.listeners
            .read()
            .get(event_name)
            .map(|list| {
                list.iter()
                    .map(|r| ListenerInfo {
                        id: r.id,
                        name: r.listener.name().to_string(),
                        priority: r.priority,
                        source_module: r.source_module.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Event names with at least one listener, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Invoke every listener of `event` in priority order.
    ///
    /// Each invocation is isolated: errors and panics are captured into the
    /// result and logged, and dispatch moves on to the next listener.
    pub fn dispatch(&self, event: &DomainEvent) -> DispatchResult {
        let event_name = event.event_name();
        let snapshot: Vec<ListenerRegistration> = match self.listeners.read().get(event_name) {
            Some(list) => list.clone(),
            None => Vec::new(),
        };

        let mut result = DispatchResult {
            event_name: event_name.to_string(),
            ..DispatchResult::default()
        };

        if snapshot.is_empty() {
            debug!(event_name = %event_name, "No listeners registered");
            return result;
        }

        counter!("modulith_events_dispatched_total", "event" => event_name.to_string()).increment(1);

        for registration in &snapshot {
            result.listeners_invoked += 1;
            let listener = &registration.listener;

            let outcome = match catch_unwind(AssertUnwindSafe(|| listener.handle(event))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(ListenerError::Panicked(panic_message(payload.as_ref()))),
            };

            match outcome {
                Ok(()) => result.success_count += 1,
                Err(e) => {
                    result.error_count += 1;
                    counter!("modulith_listener_failures_total", "event" => event_name.to_string())
                        .increment(1);

                    if matches!(e, ListenerError::Panicked(_)) {
                        error!(
                            event_name = %event_name,
                            event_id = %event.event_id(),
                            listener = listener.name(),
                            listener_id = %registration.id,
                            error = %e,
                            "Event listener panicked"
                        );
                    } else {
                        warn!(
                            event_name = %event_name,
                            event_id = %event.event_id(),
                            listener = listener.name(),
                            listener_id = %registration.id,
                            error = %e,
                            "Event listener failed"
                        );
                    }

                    result.failures.push(ListenerFailure {
                        listener_id: registration.id,
                        listener: listener.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        debug!(
            event_name = %event_name,
            invoked = result.listeners_invoked,
            errors = result.error_count,
            "Event dispatched"
        );
        result
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        f.debug_struct("EventDispatcher").field("listeners", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(name: &str) -> DomainEvent {
        DomainEvent::from_value(name, json!({})).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> impl Fn(&DomainEvent) -> Result<(), ListenerError> {
        let log = Arc::clone(log);
        move |_: &DomainEvent| {
            log.lock().push(label.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_no_listeners_is_a_noop() {
        let dispatcher = EventDispatcher::new();
        let result = dispatcher.dispatch(&event("user.registered"));
        assert_eq!(result.listeners_invoked, 0);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.error_count, 0);
    }

    #[test]
    fn test_equal_priorities_keep_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on("e", "first", 10, recorder(&log, "first"));
        dispatcher.on("e", "high", 20, recorder(&log, "high"));
        dispatcher.on("e", "second", 10, recorder(&log, "second"));
        dispatcher.on("e", "low", -5, recorder(&log, "low"));
        dispatcher.on("e", "third", 10, recorder(&log, "third"));

        dispatcher.dispatch(&event("e"));
        assert_eq!(*log.lock(), vec!["high", "first", "second", "third", "low"]);
    }

    #[test]
    fn test_remove_listener() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.on("e", "only", 0, |_| Ok(()));
        assert!(dispatcher.has_listeners("e"));
        assert!(!dispatcher.remove_listener("e", ListenerId(999)));
        assert!(dispatcher.remove_listener("e", id));
        assert!(!dispatcher.has_listeners("e"));
        assert!(!dispatcher.remove_listener("e", id));
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on("e", "panics", 10, |_| panic!("listener blew up"));
        dispatcher.on("e", "works", 0, |_| Ok(()));

        let result = dispatcher.dispatch(&event("e"));
        assert_eq!(result.listeners_invoked, 2);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.failures[0].listener, "panics");
        assert!(result.failures[0].error.contains("listener blew up"));
    }

    #[test]
    fn test_listener_may_register_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.on("e", "registrar", 0, move |_| {
            inner.on("later", "late", 0, |_| Ok(()));
            Ok(())
        });

        let result = dispatcher.dispatch(&event("e"));
        assert_eq!(result.success_count, 1);
        assert!(dispatcher.has_listeners("later"));
    }

    #[test]
    fn test_remove_module_listeners() {
        let dispatcher = EventDispatcher::new();
        let noop: Arc<dyn EventListener> = Arc::new(FnListener::new("noop", |_: &DomainEvent| Ok(())));
        dispatcher.add_module_listener("a", Arc::clone(&noop), 0, Some("billing".into()));
        dispatcher.add_module_listener("b", Arc::clone(&noop), 0, Some("billing".into()));
        dispatcher.add_module_listener("b", Arc::clone(&noop), 0, Some("audit".into()));

        assert_eq!(dispatcher.remove_module_listeners("billing"), 2);
        assert!(!dispatcher.has_listeners("a"));
        assert_eq!(dispatcher.listeners("b")[0].source_module.as_deref(), Some("audit"));
    }
}
