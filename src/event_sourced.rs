//! The base aggregate store: load by replay, save by conditional append.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::entity::{Entity, EventTypeSet};
use crate::error::StoreError;
use crate::event::{StreamId, decode_event, encode_event};
use crate::event_store::{EventStore, ExpectedVersion};
use crate::store::{AggregateStore, LoadOptions};

/// An [`AggregateStore`] that keeps nothing but the event log.
///
/// Every load replays the stream from the aggregate's current version.
/// Every save appends the unsaved events with
/// [`ExpectedVersion::Exact`] set to the aggregate's committed version.
pub struct EventSourcedStore<E: Entity, S> {
    events: S,
    event_types: EventTypeSet,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity, S> fmt::Debug for EventSourcedStore<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSourcedStore")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

impl<E: Entity, S: EventStore> EventSourcedStore<E, S> {
    /// Create a store over an event store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `E` declares no event types or
    /// declares a type twice.
    pub fn new(events: S) -> Result<Self, StoreError> {
        Ok(Self {
            events,
            event_types: EventTypeSet::of::<E>()?,
            _entity: PhantomData,
        })
    }

    /// The underlying event store.
    pub fn event_store(&self) -> &S {
        &self.events
    }
}

#[async_trait]
impl<E: Entity, S: EventStore> AggregateStore<E> for EventSourcedStore<E, S> {
    fn new_aggregate(&self, id: Option<Uuid>) -> Result<Aggregate<E>, StoreError> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        Ok(Aggregate::new(E::new(id), 0))
    }

    async fn load(&self, id: Uuid, options: LoadOptions) -> Result<Aggregate<E>, StoreError> {
        let mut aggregate = self.new_aggregate(Some(id))?;
        self.hydrate(&mut aggregate, options).await?;
        if aggregate.version() == 0 {
            return Err(StoreError::NotFound {
                stream: StreamId::of::<E>(id),
            });
        }
        Ok(aggregate)
    }

    async fn hydrate(
        &self,
        aggregate: &mut Aggregate<E>,
        options: LoadOptions,
    ) -> Result<(), StoreError> {
        if aggregate.has_unsaved_events() {
            return Err(StoreError::Validation(
                "cannot hydrate an aggregate with unsaved events".into(),
            ));
        }

        let from = aggregate.committed_version();
        if options.to_version.is_some_and(|to| to <= from) {
            return Ok(());
        }

        let stream = StreamId::of::<E>(aggregate.id());
        let stored = self.events.read(&stream, from).await?;

        let mut next = aggregate.clone();
        for event in stored
            .iter()
            .take_while(|e| options.to_version.is_none_or(|to| e.version <= to))
        {
            let expected = next.committed_version() + 1;
            if event.version != expected {
                return Err(StoreError::Corrupted {
                    stream: stream.clone(),
                    reason: format!("expected version {expected}, found {}", event.version),
                });
            }
            if !self.event_types.contains(&event.event_type) {
                return Err(StoreError::Corrupted {
                    stream: stream.clone(),
                    reason: format!(
                        "version {} has undeclared event type '{}'",
                        event.version, event.event_type
                    ),
                });
            }
            let decoded = decode_event::<E>(event)?;
            next.apply_committed(&decoded)?;
        }

        tracing::debug!(
            stream = %stream,
            from,
            to = next.committed_version(),
            "aggregate hydrated"
        );
        *aggregate = next;
        Ok(())
    }

    async fn save(&self, aggregate: &mut Aggregate<E>) -> Result<(), StoreError> {
        if !aggregate.has_unsaved_events() {
            return Ok(());
        }

        let stream = StreamId::of::<E>(aggregate.id());
        let proposed = aggregate
            .unsaved_events()
            .iter()
            .map(encode_event::<E>)
            .collect::<Result<Vec<_>, _>>()?;
        let count = proposed.len();
        let expected = ExpectedVersion::Exact(aggregate.committed_version());

        let new_version = self.events.append(&stream, expected, proposed).await?;
        aggregate.mark_saved(new_version);

        tracing::info!(stream = %stream, version = new_version, events = count, "aggregate saved");
        Ok(())
    }
}
