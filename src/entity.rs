//! Entity trait, its event trait, and the reducer helpers built on them.

use std::collections::HashSet;
use std::fmt;

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::StoreError;

/// A domain event accepted by an [`Entity`].
///
/// Implementors are expected to be enums using adjacently tagged serde
/// (`#[serde(tag = "type", content = "data")]`), and
/// [`event_type`](EntityEvent::event_type) must return the same tag serde
/// writes for the variant.
pub trait EntityEvent:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// The type tag of this event (e.g. `"balancechanged"`).
    fn event_type(&self) -> &'static str;
}

/// A domain entity whose state is derived purely from folding its events.
///
/// The implementing type itself is the entity's state. An entity is owned
/// exclusively by its [`Aggregate`](crate::Aggregate).
///
/// # Contract
///
/// - [`new`](Entity::new) is the factory: it returns the empty state for
///   the given identity, before any event has been applied.
/// - [`apply`](Entity::apply) must be a pure function of the state and the
///   event. It returns `Err` to reject an event that would violate a domain
///   invariant (e.g. creating an entity twice).
/// - [`event_types`](Entity::event_types) is the closed set of tags the
///   entity accepts. Appending any other event fails validation.
pub trait Entity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this entity type (e.g. `"account"`). Part of every
    /// [`StreamId`](crate::StreamId).
    const ENTITY_TYPE: &'static str;

    /// The set of events this entity can apply.
    type Event: EntityEvent;

    /// Domain invariant violation returned by [`apply`](Entity::apply).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create the empty state for an entity with the given id.
    fn new(id: Uuid) -> Self;

    /// The entity's identity.
    fn entity_id(&self) -> Uuid;

    /// Tags of every event type this entity declares.
    fn event_types() -> &'static [&'static str];

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Result<Self, Self::Error>;
}

/// Fold a sequence of events over an entity state, stopping at the first
/// rejected event.
///
/// # Errors
///
/// Returns the entity's domain error for the first event it rejects.
pub fn fold<E: Entity>(entity: E, events: &[E::Event]) -> Result<E, E::Error> {
    events.iter().try_fold(entity, |state, event| state.apply(event))
}

/// The declared event tags of one entity type, resolved once when a store
/// is constructed.
#[derive(Debug, Clone)]
pub struct EventTypeSet {
    entity_type: &'static str,
    tags: HashSet<&'static str>,
}

impl EventTypeSet {
    /// Resolve the declared tags of `E`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `E` declares no event types or
    /// declares the same tag twice.
    pub fn of<E: Entity>() -> Result<Self, StoreError> {
        let declared = E::event_types();
        if declared.is_empty() {
            return Err(StoreError::Validation(format!(
                "entity '{}' declares no event types",
                E::ENTITY_TYPE
            )));
        }

        let mut tags = HashSet::with_capacity(declared.len());
        for &tag in declared {
            if !tags.insert(tag) {
                return Err(StoreError::Validation(format!(
                    "entity '{}' declares event type '{tag}' more than once",
                    E::ENTITY_TYPE
                )));
            }
        }

        Ok(Self {
            entity_type: E::ENTITY_TYPE,
            tags,
        })
    }

    /// Returns `true` if `tag` is declared.
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Check that `tag` is declared.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] naming the entity and the tag.
    pub fn ensure(&self, tag: &str) -> Result<(), StoreError> {
        if self.contains(tag) {
            Ok(())
        } else {
            Err(StoreError::Validation(format!(
                "event type '{tag}' is not declared by entity '{}'",
                self.entity_type
            )))
        }
    }
}
