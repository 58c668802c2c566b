//! Domain events and their metadata.
//!
//! This module provides:
//! - [`DomainEvent`], the immutable schema-less event passed through the dispatcher
//! - [`TypedEvent`] for typed DTOs on top of the untyped payload
//! - [`EventMetadata`], the audit context persisted next to stored events

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::dispatcher::DispatchError;

/// Aggregate id used when an event does not name its aggregate.
pub const UNKNOWN_AGGREGATE_ID: &str = "unknown";

// =============================================================================
// Event IDs
// =============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The aggregate an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub id: String,
    pub aggregate_type: String,
}

impl AggregateRef {
    pub fn new(id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
        }
    }
}

// =============================================================================
// Domain Event
// =============================================================================

/// An immutable domain event.
///
/// The payload is an untyped JSON object; use [`TypedEvent`] and
/// [`DomainEvent::typed`] to work with DTOs at call sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_id: EventId,
    event_name: String,
    payload: Map<String, Value>,
    occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregate: Option<AggregateRef>,
    source_type: String,
}

impl DomainEvent {
    /// Create an event occurring now.
    ///
    /// Fails with [`DispatchError::InvalidEvent`] if the name is blank.
    pub fn new(event_name: impl Into<String>, payload: Map<String, Value>) -> Result<Self, DispatchError> {
        let event_name = event_name.into();
        if event_name.trim().is_empty() {
            return Err(DispatchError::InvalidEvent("event name must not be empty".into()));
        }

        Ok(Self {
            event_id: EventId::new(),
            event_name,
            payload,
            occurred_at: Utc::now(),
            aggregate: None,
            source_type: "DomainEvent".to_string(),
        })
    }

    /// Create an event from any JSON value; the value must be an object.
    pub fn from_value(event_name: impl Into<String>, payload: Value) -> Result<Self, DispatchError> {
        match payload {
            Value::Object(map) => Self::new(event_name, map),
            other => Err(DispatchError::InvalidEvent(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Create an event from a typed DTO.
    pub fn from_typed<T: TypedEvent>(event: &T) -> Result<Self, DispatchError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| DispatchError::InvalidEvent(format!("payload serialization failed: {}", e)))?;
        let mut domain_event = Self::from_value(T::NAME, payload)?;
        domain_event.aggregate = event.aggregate();
        domain_event.source_type = short_type_name::<T>().to_string();
        Ok(domain_event)
    }

    pub fn with_aggregate(mut self, id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        self.aggregate = Some(AggregateRef::new(id, aggregate_type));
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn aggregate(&self) -> Option<&AggregateRef> {
        self.aggregate.as_ref()
    }

    /// Type name of whatever produced this event.
    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    /// `(aggregate_id, aggregate_type)` this event is versioned under.
    ///
    /// Events without an aggregate fall back to `"unknown"` and their source type.
    pub fn aggregate_key(&self) -> (String, String) {
        match &self.aggregate {
            Some(agg) => (agg.id.clone(), agg.aggregate_type.clone()),
            None => (UNKNOWN_AGGREGATE_ID.to_string(), self.source_type.clone()),
        }
    }

    /// Deserialize the payload into a typed DTO.
    pub fn typed<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// =============================================================================
// Typed Events
// =============================================================================

/// A typed DTO that travels as a [`DomainEvent`].
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { order_id: String, total_cents: u64 }
///
/// impl TypedEvent for OrderPlaced {
///     const NAME: &'static str = "order.placed";
///     fn aggregate(&self) -> Option<AggregateRef> {
///         Some(AggregateRef::new(&self.order_id, "Order"))
///     }
/// }
/// ```
pub trait TypedEvent: Serialize {
    /// Event name used for dispatch.
    const NAME: &'static str;

    /// The aggregate this event belongs to, if any.
    fn aggregate(&self) -> Option<AggregateRef> {
        None
    }
}

// =============================================================================
// Event Metadata
// =============================================================================

/// Audit context stored alongside an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Anything else worth keeping.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor_id = Some(actor.into());
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: String,
        total_cents: u64,
    }

    impl TypedEvent for OrderPlaced {
        const NAME: &'static str = "order.placed";

        fn aggregate(&self) -> Option<AggregateRef> {
            Some(AggregateRef::new(&self.order_id, "Order"))
        }
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(matches!(
            DomainEvent::new("  ", Map::new()),
            Err(DispatchError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        let err = DomainEvent::from_value("user.registered", json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_typed_round_trip_keeps_aggregate() {
        let placed = OrderPlaced {
            order_id: "order-1".into(),
            total_cents: 4200,
        };
        let event = DomainEvent::from_typed(&placed).unwrap();

        assert_eq!(event.event_name(), "order.placed");
        assert_eq!(event.source_type(), "OrderPlaced");
        assert_eq!(event.aggregate_key(), ("order-1".to_string(), "Order".to_string()));
        assert_eq!(event.typed::<OrderPlaced>().unwrap(), placed);
    }

    #[test]
    fn test_aggregate_key_falls_back_to_source_type() {
        let event = DomainEvent::from_value("user.registered", json!({"email": "a@b.c"}))
            .unwrap()
            .with_source_type("UserRegistered");
        assert_eq!(
            event.aggregate_key(),
            ("unknown".to_string(), "UserRegistered".to_string())
        );
    }

    #[test]
    fn test_metadata_flattens_extra() {
        let metadata = EventMetadata::new()
            .with_actor("user-7")
            .with_ip_address("10.0.0.1")
            .with_extra("tenant", "acme");
        let value = metadata.to_value();
        assert_eq!(value["actor_id"], json!("user-7"));
        assert_eq!(value["tenant"], json!("acme"));
        assert!(value.get("user_agent").is_none());

        let back: EventMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, metadata);
    }
}
