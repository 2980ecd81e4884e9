//! Versioned, in-memory holder of one entity's state and unsaved events.

use uuid::Uuid;

use crate::entity::{Entity, EntityEvent};
use crate::error::StoreError;

/// One entity's state together with its committed version and the events
/// appended since the last save.
///
/// `version() == committed_version() + unsaved_events().len()` holds at all
/// times. Unsaved events have already been folded into
/// [`entity`](Aggregate::entity) but are not yet durable.
///
/// Aggregates are created by an
/// [`AggregateStore`](crate::AggregateStore) (`new_aggregate` or `load`) and
/// only change through [`append`](Aggregate::append) or a store's `save` and
/// `hydrate`.
#[derive(Debug, Clone)]
pub struct Aggregate<E: Entity> {
    id: Uuid,
    entity: E,
    committed: u64,
    unsaved: Vec<E::Event>,
}

impl<E: Entity> Aggregate<E> {
    /// Create an aggregate from an entity state at a committed version.
    ///
    /// The aggregate's id is taken from [`Entity::entity_id`].
    pub fn new(entity: E, committed: u64) -> Self {
        Self {
            id: entity.entity_id(),
            entity,
            committed,
            unsaved: Vec::new(),
        }
    }

    /// The aggregate's identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current entity state, including unsaved events.
    pub fn entity(&self) -> &E {
        &self.entity
    }

    /// Version of the last durably committed event (0 for a fresh aggregate).
    pub fn committed_version(&self) -> u64 {
        self.committed
    }

    /// Committed version plus the number of unsaved events.
    pub fn version(&self) -> u64 {
        self.committed + self.unsaved.len() as u64
    }

    /// Events appended since the last successful save, in order.
    pub fn unsaved_events(&self) -> &[E::Event] {
        &self.unsaved
    }

    /// Returns `true` if there are events waiting to be saved.
    pub fn has_unsaved_events(&self) -> bool {
        !self.unsaved.is_empty()
    }

    /// Apply events to the in-memory state and buffer them for saving.
    ///
    /// The call is all-or-nothing: every event type is checked against
    /// [`Entity::event_types`] before any event is applied, and the events
    /// are folded over a copy of the state that only replaces the current
    /// state when every event was accepted.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Validation`] if any event's type is not declared.
    /// * [`StoreError::Domain`] if the reducer rejects an event.
    ///
    /// On error the aggregate is left exactly as it was before the call.
    pub fn append(&mut self, events: Vec<E::Event>) -> Result<(), StoreError> {
        let declared = E::event_types();
        if let Some(undeclared) = events
            .iter()
            .map(|event| event.event_type())
            .find(|tag| !declared.contains(tag))
        {
            return Err(StoreError::Validation(format!(
                "event type '{undeclared}' is not declared by entity '{}'",
                E::ENTITY_TYPE
            )));
        }

        let mut next = self.entity.clone();
        for event in &events {
            next = next.apply(event).map_err(StoreError::domain)?;
        }

        self.entity = next;
        self.unsaved.extend(events);
        Ok(())
    }

    /// Apply an event that is already durable, advancing the committed
    /// version by one.
    pub(crate) fn apply_committed(&mut self, event: &E::Event) -> Result<(), StoreError> {
        debug_assert!(self.unsaved.is_empty());
        let next = self.entity.clone().apply(event).map_err(StoreError::domain)?;
        self.entity = next;
        self.committed += 1;
        Ok(())
    }

    /// Mark every unsaved event as committed at `committed`.
    pub(crate) fn mark_saved(&mut self, committed: u64) {
        self.committed = committed;
        self.unsaved.clear();
    }
}
