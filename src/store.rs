//! The aggregate store interface shared by the base store and every
//! decorator layered over it.
//!
//! A typical chain, outermost first:
//!
//! ```text
//! InstrumentedStore -> HookableStore -> SnapshottingStore -> EventSourcedStore -> EventStore
//! ```
//!
//! Every layer forwards its inputs and the inner layer's errors unchanged.
//! Dropping a call's future cancels it at whichever await point it has
//! reached; the event store's append is all-or-nothing, so no partial
//! durable state is left behind.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::entity::Entity;
use crate::error::StoreError;

/// Options for [`AggregateStore::load`] and [`AggregateStore::hydrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Stop replay at this version. `None` replays to the head of the
    /// stream.
    pub to_version: Option<u64>,
}

impl LoadOptions {
    /// Replay to the head of the stream.
    pub fn latest() -> Self {
        Self::default()
    }

    /// Replay up to and including `version`.
    pub fn to_version(version: u64) -> Self {
        Self {
            to_version: Some(version),
        }
    }
}

/// Creates, loads and saves aggregates of one entity type.
#[async_trait]
pub trait AggregateStore<E: Entity>: Send + Sync + 'static {
    /// Create a fresh aggregate at version 0.
    ///
    /// When `id` is `None` a new random id is generated.
    fn new_aggregate(&self, id: Option<Uuid>) -> Result<Aggregate<E>, StoreError>;

    /// Load an aggregate by replaying its stream.
    ///
    /// # Errors
    ///
    /// * [`StoreError::NotFound`] if the stream has no events (and no
    ///   snapshot covers it).
    /// * [`StoreError::Corrupted`] if the stream holds an undeclared event
    ///   type or has a gap.
    /// * Backing-store errors, unchanged.
    async fn load(&self, id: Uuid, options: LoadOptions) -> Result<Aggregate<E>, StoreError>;

    /// Advance an aggregate by replaying the events committed after its
    /// current version.
    ///
    /// Leaves the aggregate unchanged if it is already at or past
    /// `options.to_version`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] if the aggregate has unsaved events, plus
    /// the replay errors of [`load`](AggregateStore::load). On error the
    /// aggregate is unchanged.
    async fn hydrate(
        &self,
        aggregate: &mut Aggregate<E>,
        options: LoadOptions,
    ) -> Result<(), StoreError>;

    /// Durably append the aggregate's unsaved events.
    ///
    /// Uses the aggregate's committed version as the expected stream
    /// version. A save with no unsaved events does nothing.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if another writer advanced the stream
    /// first. On error the aggregate is unchanged and the caller should
    /// reload before retrying.
    async fn save(&self, aggregate: &mut Aggregate<E>) -> Result<(), StoreError>;
}

#[async_trait]
impl<E, S> AggregateStore<E> for Arc<S>
where
    E: Entity,
    S: AggregateStore<E> + ?Sized,
{
    fn new_aggregate(&self, id: Option<Uuid>) -> Result<Aggregate<E>, StoreError> {
        (**self).new_aggregate(id)
    }

    async fn load(&self, id: Uuid, options: LoadOptions) -> Result<Aggregate<E>, StoreError> {
        (**self).load(id, options).await
    }

    async fn hydrate(
        &self,
        aggregate: &mut Aggregate<E>,
        options: LoadOptions,
    ) -> Result<(), StoreError> {
        (**self).hydrate(aggregate, options).await
    }

    async fn save(&self, aggregate: &mut Aggregate<E>) -> Result<(), StoreError> {
        (**self).save(aggregate).await
    }
}
