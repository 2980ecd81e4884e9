//! Snapshot-accelerated loading and policy-driven snapshot writes.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::entity::Entity;
use crate::error::StoreError;
use crate::event::StreamId;
use crate::snapshot::{Snapshot, SnapshotPolicy, SnapshotStore};
use crate::store::{AggregateStore, LoadOptions};

/// Decorator that seeds loads from the latest usable snapshot and writes a
/// new snapshot after a save whenever the policy asks for one.
///
/// Snapshots only change how much of a stream is replayed, never the state
/// or version a load returns. Snapshot failures on either path are logged
/// and otherwise ignored: a failed read falls back to a full replay, and a
/// failed write leaves the already-committed save in place.
pub struct SnapshottingStore<E: Entity, I, S> {
    inner: I,
    snapshots: S,
    policy: Box<dyn SnapshotPolicy>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity, I, S> fmt::Debug for SnapshottingStore<E, I, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshottingStore")
            .field("entity_type", &E::ENTITY_TYPE)
            .finish_non_exhaustive()
    }
}

impl<E, I, S> SnapshottingStore<E, I, S>
where
    E: Entity,
    I: AggregateStore<E>,
    S: SnapshotStore,
{
    /// Wrap `inner`, storing snapshots in `snapshots` according to
    /// `policy`.
    pub fn new(inner: I, snapshots: S, policy: impl SnapshotPolicy) -> Self {
        Self {
            inner,
            snapshots,
            policy: Box::new(policy),
            _entity: PhantomData,
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &I {
        &self.inner
    }

    /// The snapshot store.
    pub fn snapshot_store(&self) -> &S {
        &self.snapshots
    }

    /// Build an aggregate from the latest snapshot at or below
    /// `max_version`, or `None` if there is no usable one.
    async fn from_snapshot(&self, id: Uuid, max_version: Option<u64>) -> Option<Aggregate<E>> {
        let stream = StreamId::of::<E>(id);
        let snapshot = match self.snapshots.read_latest(&stream, max_version).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "snapshot read failed; replaying full stream");
                return None;
            }
        };

        let entity = match serde_json::from_value::<E>(snapshot.state) {
            Ok(entity) => entity,
            Err(e) => {
                tracing::warn!(
                    stream = %stream,
                    version = snapshot.version,
                    error = %e,
                    "failed to decode snapshot; replaying full stream"
                );
                return None;
            }
        };
        if entity.entity_id() != id {
            tracing::warn!(
                stream = %stream,
                version = snapshot.version,
                "snapshot belongs to another entity; replaying full stream"
            );
            return None;
        }

        tracing::debug!(stream = %stream, version = snapshot.version, "loaded from snapshot");
        Some(Aggregate::new(entity, snapshot.version))
    }

    /// Write a snapshot of `aggregate` if the policy asks for one.
    async fn maybe_snapshot(&self, aggregate: &Aggregate<E>) -> Result<(), StoreError> {
        let stream = StreamId::of::<E>(aggregate.id());
        let new_version = aggregate.committed_version();
        let last = self
            .snapshots
            .read_latest(&stream, None)
            .await?
            .map_or(0, |s| s.version);

        if !self.policy.should_snapshot(last, new_version) {
            return Ok(());
        }

        self.snapshots
            .write(Snapshot {
                stream_id: stream.clone(),
                version: new_version,
                state: serde_json::to_value(aggregate.entity())?,
                taken_at: Utc::now(),
            })
            .await?;
        tracing::debug!(stream = %stream, version = new_version, "snapshot written");
        Ok(())
    }
}

#[async_trait]
impl<E, I, S> AggregateStore<E> for SnapshottingStore<E, I, S>
where
    E: Entity,
    I: AggregateStore<E>,
    S: SnapshotStore,
{
    fn new_aggregate(&self, id: Option<Uuid>) -> Result<Aggregate<E>, StoreError> {
        self.inner.new_aggregate(id)
    }

    async fn load(&self, id: Uuid, options: LoadOptions) -> Result<Aggregate<E>, StoreError> {
        match self.from_snapshot(id, options.to_version).await {
            Some(mut aggregate) => {
                self.inner.hydrate(&mut aggregate, options).await?;
                Ok(aggregate)
            }
            None => self.inner.load(id, options).await,
        }
    }

    async fn hydrate(
        &self,
        aggregate: &mut Aggregate<E>,
        options: LoadOptions,
    ) -> Result<(), StoreError> {
        self.inner.hydrate(aggregate, options).await
    }

    async fn save(&self, aggregate: &mut Aggregate<E>) -> Result<(), StoreError> {
        if !aggregate.has_unsaved_events() {
            return Ok(());
        }
        self.inner.save(aggregate).await?;

        if let Err(e) = self.maybe_snapshot(aggregate).await {
            tracing::warn!(
                aggregate_id = %aggregate.id(),
                version = aggregate.committed_version(),
                error = %e,
                "snapshot write failed; save already committed"
            );
        }
        Ok(())
    }
}
