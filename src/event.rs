//! Stream identity and the persisted shapes of events.
//!
//! Domain events are converted to [`ProposedEvent`]s before they reach an
//! [`EventStore`](crate::EventStore), and come back as [`StoredEvent`]s
//! carrying their stream-relative version. No I/O happens here.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityEvent};
use crate::error::StoreError;

/// Identity of one event stream: the entity type plus the entity's id.
///
/// Displayed as `"<entity_type>/<id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    entity_type: String,
    id: Uuid,
}

impl StreamId {
    /// Build a stream identity from an entity type name and an id.
    pub fn new(entity_type: impl Into<String>, id: Uuid) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
        }
    }

    /// Stream identity for entity type `E`.
    pub fn of<E: Entity>(id: Uuid) -> Self {
        Self::new(E::ENTITY_TYPE, id)
    }

    /// The entity type name (e.g. `"account"`).
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The entity id.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// An event ready to be appended. It has no version until the event store
/// accepts it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Newly generated UUID v4 event ID.
    pub event_id: Uuid,
    /// Event type tag (e.g. `"balancechanged"`).
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the adjacently-tagged enum).
    pub payload: serde_json::Value,
}

/// An event as persisted in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// The stream the event belongs to.
    pub stream_id: StreamId,
    /// One-based, gap-free version within the stream.
    pub version: u64,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Store-assigned timestamp.
    pub recorded_at: DateTime<Utc>,
}

/// Encode a domain event into a [`ProposedEvent`].
///
/// The `Event` type must use `#[serde(tag = "type", content = "data")]`
/// adjacently tagged serialization. The serialized `"type"` must equal
/// [`EntityEvent::event_type`]; the `"data"` portion becomes the payload
/// (`null` for fieldless variants).
///
/// # Errors
///
/// * [`StoreError::Serialization`] if the event cannot be serialized.
/// * [`StoreError::Validation`] if it does not serialize to a tagged object
///   or the tag disagrees with `event_type()`.
pub fn encode_event<E: Entity>(event: &E::Event) -> Result<ProposedEvent, StoreError> {
    let value = serde_json::to_value(event)?;
    let obj = value.as_object().ok_or_else(|| {
        StoreError::Validation("event must serialize to an adjacently tagged object".into())
    })?;

    let tag = obj.get("type").and_then(|t| t.as_str()).ok_or_else(|| {
        StoreError::Validation("event must serialize with a string 'type' field".into())
    })?;

    let event_type = event.event_type();
    if tag != event_type {
        return Err(StoreError::Validation(format!(
            "event serialized as '{tag}' but declares type '{event_type}'"
        )));
    }

    let payload = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);

    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_owned(),
        payload,
    })
}

/// Decode a [`StoredEvent`] back into the entity's domain event.
///
/// Reconstructs the adjacently-tagged JSON object from the stored type tag
/// and payload.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the payload does not match any
/// variant of `E::Event`.
pub fn decode_event<E: Entity>(stored: &StoredEvent) -> Result<E::Event, StoreError> {
    let tagged = if stored.payload.is_null() {
        serde_json::json!({ "type": stored.event_type })
    } else {
        serde_json::json!({
            "type": stored.event_type,
            "data": stored.payload,
        })
    };
    Ok(serde_json::from_value::<E::Event>(tagged)?)
}
