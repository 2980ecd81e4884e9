//! Event-sourced aggregate persistence.
//!
//! Entities are rebuilt by folding their events, persisted through an
//! append-only [`EventStore`] with optimistic concurrency, and served by a
//! chain of [`AggregateStore`] layers: [`EventSourcedStore`] at the base,
//! wrapped by [`SnapshottingStore`], [`HookableStore`] and
//! [`InstrumentedStore`]. Committed events reach external handlers at least
//! once through an [`Outbox`] drained by a [`Processor`].

mod aggregate;
mod entity;
mod error;
mod event;
mod event_sourced;
mod event_store;
mod file_snapshot;
mod hookable;
mod instrumented;
mod outbox;
mod processor;
mod snapshot;
mod snapshotting;
mod store;

pub use aggregate::Aggregate;
pub use entity::{Entity, EntityEvent, EventTypeSet, fold};
pub use error::{BoxError, HandlerError, StoreError};
pub use event::{ProposedEvent, StoredEvent, StreamId, decode_event, encode_event};
pub use event_sourced::EventSourcedStore;
pub use event_store::{EventStore, ExpectedVersion, MemoryEventStore};
pub use file_snapshot::FileSnapshotStore;
pub use hookable::HookableStore;
pub use instrumented::{
    DEFAULT_EVENT_STORE_NAMESPACE, DEFAULT_NAMESPACE, DEFAULT_SNAPSHOT_STORE_NAMESPACE,
    InstrumentedEventStore, InstrumentedSnapshotStore, InstrumentedStore,
};
pub use outbox::{ClaimedItem, Outbox, OutboxBuilder, OutboxHandler, OutboxItem, OutboxTransaction};
pub use processor::{Processor, ProcessorConfig, ProcessorHandle};
pub use snapshot::{EventCountPolicy, MemorySnapshotStore, Snapshot, SnapshotPolicy, SnapshotStore};
pub use snapshotting::SnapshottingStore;
pub use store::{AggregateStore, LoadOptions};
