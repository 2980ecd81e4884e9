//! Bank-account REST service built on `ledgerfold` aggregate stores.
//!
//! [`build_store`] assembles the store chain used by the service:
//! an in-memory event store feeding the outbox, event sourcing, periodic
//! snapshots, logging hooks and instrumentation, outermost last. Each
//! layer that touches storage is instrumented under its own namespace.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod notifications;
pub mod storage;
pub mod telemetry;

use std::sync::Arc;

use ledgerfold::{
    AggregateStore, EventCountPolicy, EventSourcedStore, FileSnapshotStore, HookableStore,
    InstrumentedEventStore, InstrumentedSnapshotStore, InstrumentedStore, MemoryEventStore,
    MemorySnapshotStore, Outbox, SnapshotStore, SnapshottingStore, StoreError,
};

use crate::config::ServiceConfig;
use crate::domain::Account;

/// Metric and span namespace of the account store.
pub const STORE_NAMESPACE: &str = "accounts";

/// Namespace of the event-sourced layer below snapshotting and hooks.
pub const SOURCED_NAMESPACE: &str = "accounts_eventsourced";

/// Namespace of the account event store.
pub const EVENT_STORE_NAMESPACE: &str = "accounts_events";

/// Namespace of the account snapshot store.
pub const SNAPSHOT_STORE_NAMESPACE: &str = "accounts_snapshots";

/// Build the account store chain.
///
/// Events are appended to a [`MemoryEventStore`] that co-commits outbox
/// items into `outbox`. Snapshots go to `config.snapshot_dir` when set,
/// otherwise they are kept in memory.
///
/// # Errors
///
/// Returns [`StoreError::Validation`] if [`Account`] declares an invalid
/// set of event types.
pub fn build_store(
    config: &ServiceConfig,
    outbox: Outbox,
) -> Result<Arc<dyn AggregateStore<Account>>, StoreError> {
    let events = InstrumentedEventStore::new(MemoryEventStore::new().with_outbox(outbox))
        .with_metric_namespace(EVENT_STORE_NAMESPACE)
        .with_trace_namespace(EVENT_STORE_NAMESPACE);
    let sourced = InstrumentedStore::new(EventSourcedStore::<Account, _>::new(events)?)
        .with_metric_namespace(SOURCED_NAMESPACE)
        .with_trace_namespace(SOURCED_NAMESPACE);

    let snapshots: Arc<dyn SnapshotStore> = match &config.snapshot_dir {
        Some(dir) => Arc::new(instrument_snapshots(FileSnapshotStore::new(dir.clone()))),
        None => Arc::new(instrument_snapshots(MemorySnapshotStore::new())),
    };
    let snapshotting = SnapshottingStore::new(
        sourced,
        snapshots,
        EventCountPolicy::new(config.snapshot_every),
    );

    let hooked = HookableStore::new(snapshotting)
        .before_save(|aggregate| {
            tracing::debug!(
                account_id = %aggregate.id(),
                unsaved = aggregate.unsaved_events().len(),
                "saving account"
            );
            Ok(())
        })
        .after_load(|aggregate| {
            tracing::debug!(
                account_id = %aggregate.id(),
                version = aggregate.version(),
                "account loaded"
            );
            Ok(())
        });

    let instrumented = InstrumentedStore::new(hooked)
        .with_metric_namespace(STORE_NAMESPACE)
        .with_trace_namespace(STORE_NAMESPACE);

    Ok(Arc::new(instrumented))
}

fn instrument_snapshots<S: SnapshotStore>(store: S) -> InstrumentedSnapshotStore<S> {
    InstrumentedSnapshotStore::new(store)
        .with_metric_namespace(SNAPSHOT_STORE_NAMESPACE)
        .with_trace_namespace(SNAPSHOT_STORE_NAMESPACE)
}
