//! Tracing spans and metrics around every store operation.
//!
//! Three decorators share one naming scheme:
//!
//! * [`InstrumentedStore`] wraps an [`AggregateStore`] (default namespace
//!   [`DEFAULT_NAMESPACE`]).
//! * [`InstrumentedEventStore`] wraps an [`EventStore`] (default namespace
//!   [`DEFAULT_EVENT_STORE_NAMESPACE`]).
//! * [`InstrumentedSnapshotStore`] wraps a [`SnapshotStore`] (default
//!   namespace [`DEFAULT_SNAPSHOT_STORE_NAMESPACE`]).
//!
//! Metric names are `<metric_namespace>_<operation>_total` (counter,
//! labelled with `outcome`) and
//! `<metric_namespace>_<operation>_duration_seconds` (histogram, same
//! label). Span names are reported as `<trace_namespace>.<operation>`
//! through the `otel.name` field. Nothing is recorded unless the
//! application installs a `metrics` recorder and a `tracing` subscriber.

use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::Instrument;
use tracing::field::Empty;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::entity::Entity;
use crate::error::StoreError;
use crate::event::{ProposedEvent, StoredEvent, StreamId};
use crate::event_store::{EventStore, ExpectedVersion};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::{AggregateStore, LoadOptions};

/// Default namespace for aggregate store metric and span names.
pub const DEFAULT_NAMESPACE: &str = "aggregatestore";

/// Default namespace for event store metric and span names.
pub const DEFAULT_EVENT_STORE_NAMESPACE: &str = "eventstore";

/// Default namespace for snapshot store metric and span names.
pub const DEFAULT_SNAPSHOT_STORE_NAMESPACE: &str = "snapshotstore";

/// Metric and span prefixes of one instrumented layer.
#[derive(Debug, Clone)]
struct Namespaces {
    metric: String,
    trace: String,
}

impl Namespaces {
    fn new(default: &str) -> Self {
        Self {
            metric: default.to_owned(),
            trace: default.to_owned(),
        }
    }

    fn otel_name(&self, operation: &str) -> String {
        format!("{}.{operation}", self.trace)
    }

    fn record<T>(&self, operation: &'static str, started: Instant, result: &Result<T, StoreError>) {
        self.record_outcome(operation, started, outcome(result));
        if let Err(e) = result {
            tracing::debug!(operation, error = %e, "store operation failed");
        }
    }

    fn record_outcome(&self, operation: &'static str, started: Instant, outcome: &'static str) {
        let labels = [("outcome", outcome)];
        counter!(format!("{}_{operation}_total", self.metric), &labels).increment(1);
        histogram!(
            format!("{}_{operation}_duration_seconds", self.metric),
            &labels
        )
        .record(started.elapsed().as_secs_f64());
    }
}

/// Metric label for a result.
fn outcome<T>(result: &Result<T, StoreError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(StoreError::Validation(_)) => "validation",
        Err(StoreError::Domain(_)) => "domain",
        Err(StoreError::NotFound { .. }) => "not_found",
        Err(StoreError::Conflict { .. }) => "conflict",
        Err(StoreError::Hook(_)) => "hook",
        Err(StoreError::Corrupted { .. }) => "corrupted",
        Err(_) => "error",
    }
}

/// Decorator that records latency and outcome of every aggregate store
/// operation and wraps each one in a span.
///
/// Inputs, results and errors pass through unchanged. Two instances in one
/// chain can be told apart by giving them different namespaces.
pub struct InstrumentedStore<E: Entity, I> {
    inner: I,
    namespaces: Namespaces,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity, I> fmt::Debug for InstrumentedStore<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedStore")
            .field("metric_namespace", &self.namespaces.metric)
            .field("trace_namespace", &self.namespaces.trace)
            .finish_non_exhaustive()
    }
}

impl<E: Entity, I: AggregateStore<E>> InstrumentedStore<E, I> {
    /// Wrap `inner` using [`DEFAULT_NAMESPACE`] for metrics and spans.
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            namespaces: Namespaces::new(DEFAULT_NAMESPACE),
            _entity: PhantomData,
        }
    }

    /// Set the prefix of metric names.
    pub fn with_metric_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.metric = namespace.into();
        self
    }

    /// Set the prefix of span names.
    pub fn with_trace_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.trace = namespace.into();
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &I {
        &self.inner
    }

    fn span(&self, operation: &'static str, id: Option<Uuid>) -> tracing::Span {
        let span = tracing::info_span!(
            "aggregate_store",
            otel.name = %self.namespaces.otel_name(operation),
            entity_type = E::ENTITY_TYPE,
            aggregate_id = Empty,
            version = Empty,
        );
        if let Some(id) = id {
            span.record("aggregate_id", tracing::field::display(id));
        }
        span
    }
}

#[async_trait]
impl<E: Entity, I: AggregateStore<E>> AggregateStore<E> for InstrumentedStore<E, I> {
    fn new_aggregate(&self, id: Option<Uuid>) -> Result<Aggregate<E>, StoreError> {
        let span = self.span("new_aggregate", id);
        let _entered = span.enter();
        let started = Instant::now();
        let result = self.inner.new_aggregate(id);
        if let Ok(aggregate) = &result {
            span.record("aggregate_id", tracing::field::display(aggregate.id()));
        }
        self.namespaces.record("new_aggregate", started, &result);
        result
    }

    async fn load(&self, id: Uuid, options: LoadOptions) -> Result<Aggregate<E>, StoreError> {
        let span = self.span("load", Some(id));
        let started = Instant::now();
        let result = self.inner.load(id, options).instrument(span.clone()).await;
        if let Ok(aggregate) = &result {
            span.record("version", aggregate.version());
        }
        self.namespaces.record("load", started, &result);
        result
    }

    async fn hydrate(
        &self,
        aggregate: &mut Aggregate<E>,
        options: LoadOptions,
    ) -> Result<(), StoreError> {
        let span = self.span("hydrate", Some(aggregate.id()));
        let started = Instant::now();
        let result = self
            .inner
            .hydrate(aggregate, options)
            .instrument(span.clone())
            .await;
        span.record("version", aggregate.version());
        self.namespaces.record("hydrate", started, &result);
        result
    }

    async fn save(&self, aggregate: &mut Aggregate<E>) -> Result<(), StoreError> {
        let span = self.span("save", Some(aggregate.id()));
        let started = Instant::now();
        let result = self.inner.save(aggregate).instrument(span.clone()).await;
        span.record("version", aggregate.version());
        self.namespaces.record("save", started, &result);
        result
    }
}

/// Decorator that records latency and outcome of every event store call.
pub struct InstrumentedEventStore<S> {
    inner: S,
    namespaces: Namespaces,
}

impl<S> fmt::Debug for InstrumentedEventStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedEventStore")
            .field("metric_namespace", &self.namespaces.metric)
            .field("trace_namespace", &self.namespaces.trace)
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> InstrumentedEventStore<S> {
    /// Wrap `inner` using [`DEFAULT_EVENT_STORE_NAMESPACE`].
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            namespaces: Namespaces::new(DEFAULT_EVENT_STORE_NAMESPACE),
        }
    }

    /// Set the prefix of metric names.
    pub fn with_metric_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.metric = namespace.into();
        self
    }

    /// Set the prefix of span names.
    pub fn with_trace_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.trace = namespace.into();
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: EventStore> EventStore for InstrumentedEventStore<S> {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, StoreError> {
        let span = tracing::info_span!(
            "event_store",
            otel.name = %self.namespaces.otel_name("append"),
            stream = %stream,
            expected = %expected,
            events = events.len(),
            version = Empty,
        );
        let started = Instant::now();
        let result = self
            .inner
            .append(stream, expected, events)
            .instrument(span.clone())
            .await;
        if let Ok(version) = &result {
            span.record("version", *version);
        }
        self.namespaces.record("append", started, &result);
        result
    }

    async fn read(
        &self,
        stream: &StreamId,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let span = tracing::info_span!(
            "event_store",
            otel.name = %self.namespaces.otel_name("read"),
            stream = %stream,
            after_version,
            events = Empty,
        );
        let started = Instant::now();
        let result = self
            .inner
            .read(stream, after_version)
            .instrument(span.clone())
            .await;
        if let Ok(events) = &result {
            span.record("events", events.len());
        }
        self.namespaces.record("read", started, &result);
        result
    }
}

/// Decorator that records latency and outcome of every snapshot store
/// call.
///
/// A `read_latest` that finds nothing is labelled `miss` rather than
/// `success`.
pub struct InstrumentedSnapshotStore<S> {
    inner: S,
    namespaces: Namespaces,
}

impl<S> fmt::Debug for InstrumentedSnapshotStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedSnapshotStore")
            .field("metric_namespace", &self.namespaces.metric)
            .field("trace_namespace", &self.namespaces.trace)
            .finish_non_exhaustive()
    }
}

impl<S: SnapshotStore> InstrumentedSnapshotStore<S> {
    /// Wrap `inner` using [`DEFAULT_SNAPSHOT_STORE_NAMESPACE`].
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            namespaces: Namespaces::new(DEFAULT_SNAPSHOT_STORE_NAMESPACE),
        }
    }

    /// Set the prefix of metric names.
    pub fn with_metric_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.metric = namespace.into();
        self
    }

    /// Set the prefix of span names.
    pub fn with_trace_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.trace = namespace.into();
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: SnapshotStore> SnapshotStore for InstrumentedSnapshotStore<S> {
    async fn write(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let span = tracing::info_span!(
            "snapshot_store",
            otel.name = %self.namespaces.otel_name("write"),
            stream = %snapshot.stream_id,
            version = snapshot.version,
        );
        let started = Instant::now();
        let result = self.inner.write(snapshot).instrument(span).await;
        self.namespaces.record("write", started, &result);
        result
    }

    async fn read_latest(
        &self,
        stream: &StreamId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let span = tracing::info_span!(
            "snapshot_store",
            otel.name = %self.namespaces.otel_name("read_latest"),
            stream = %stream,
            max_version = ?max_version,
            version = Empty,
        );
        let started = Instant::now();
        let result = self
            .inner
            .read_latest(stream, max_version)
            .instrument(span.clone())
            .await;
        match &result {
            Ok(Some(snapshot)) => {
                span.record("version", snapshot.version);
                self.namespaces
                    .record_outcome("read_latest", started, "success");
            }
            Ok(None) => self.namespaces.record_outcome("read_latest", started, "miss"),
            Err(_) => self.namespaces.record("read_latest", started, &result),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_fixtures::{Counter, CounterEvent};
    use crate::event::encode_event;
    use crate::event_sourced::EventSourcedStore;
    use crate::event_store::MemoryEventStore;
    use crate::snapshot::MemorySnapshotStore;
    use chrono::Utc;
    use metrics::{SharedString, Unit};
    use metrics_util::CompositeKey;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use std::future::Future;

    type Base = EventSourcedStore<Counter, MemoryEventStore>;
    type Recorded = Vec<(CompositeKey, Option<Unit>, Option<SharedString>, DebugValue)>;

    fn instrumented() -> InstrumentedStore<Counter, Base> {
        InstrumentedStore::new(EventSourcedStore::new(MemoryEventStore::new()).unwrap())
    }

    /// Run `f` on a single-threaded runtime with a local debugging recorder
    /// installed and return everything it recorded.
    fn recorded<F, Fut>(f: F) -> Recorded
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        metrics::with_local_recorder(&recorder, || runtime.block_on(f()));
        snapshotter.snapshot().into_vec()
    }

    fn labelled(key: &CompositeKey, name: &str, outcome: &str) -> bool {
        key.key().name() == name
            && key
                .key()
                .labels()
                .any(|l| l.key() == "outcome" && l.value() == outcome)
    }

    fn counter_value(recorded: &Recorded, name: &str, outcome: &str) -> Option<u64> {
        recorded.iter().find_map(|(key, _, _, value)| match value {
            DebugValue::Counter(n) if labelled(key, name, outcome) => Some(*n),
            _ => None,
        })
    }

    fn histogram_samples(recorded: &Recorded, name: &str, outcome: &str) -> usize {
        recorded
            .iter()
            .find_map(|(key, _, _, value)| match value {
                DebugValue::Histogram(samples) if labelled(key, name, outcome) => {
                    Some(samples.len())
                }
                _ => None,
            })
            .unwrap_or(0)
    }

    fn has_metric(recorded: &Recorded, name: &str) -> bool {
        recorded.iter().any(|(key, _, _, _)| key.key().name() == name)
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome::<()>(&Ok(())), "success");
        assert_eq!(
            outcome::<()>(&Err(StoreError::Validation("x".into()))),
            "validation"
        );
        assert_eq!(
            outcome::<()>(&Err(StoreError::Unavailable("down".into()))),
            "error"
        );
    }

    #[test]
    fn namespaces_default_and_override() {
        let store = instrumented();
        assert_eq!(store.namespaces.metric, DEFAULT_NAMESPACE);
        assert_eq!(store.namespaces.trace, DEFAULT_NAMESPACE);

        let store = store
            .with_metric_namespace("accounts")
            .with_trace_namespace("accounts.outer");
        assert_eq!(store.namespaces.metric, "accounts");
        assert_eq!(store.namespaces.otel_name("load"), "accounts.outer.load");
    }

    #[test]
    fn aggregate_store_records_counters_and_histograms_per_outcome() {
        let metrics = recorded(|| async {
            let store = instrumented();

            let err = store
                .load(Uuid::new_v4(), LoadOptions::latest())
                .await
                .unwrap_err();
            assert!(err.is_not_found());

            let mut fresh = store.new_aggregate(None).unwrap();
            let mut stale = fresh.clone();
            fresh.append(vec![CounterEvent::Opened]).unwrap();
            store.save(&mut fresh).await.unwrap();
            stale.append(vec![CounterEvent::Opened]).unwrap();
            assert!(store.save(&mut stale).await.unwrap_err().is_conflict());

            store.load(fresh.id(), LoadOptions::latest()).await.unwrap();
        });

        assert_eq!(counter_value(&metrics, "aggregatestore_load_total", "not_found"), Some(1));
        assert_eq!(counter_value(&metrics, "aggregatestore_load_total", "success"), Some(1));
        assert_eq!(counter_value(&metrics, "aggregatestore_save_total", "success"), Some(1));
        assert_eq!(counter_value(&metrics, "aggregatestore_save_total", "conflict"), Some(1));
        assert_eq!(
            counter_value(&metrics, "aggregatestore_new_aggregate_total", "success"),
            Some(1)
        );

        assert_eq!(
            histogram_samples(&metrics, "aggregatestore_load_duration_seconds", "not_found"),
            1
        );
        assert_eq!(
            histogram_samples(&metrics, "aggregatestore_save_duration_seconds", "conflict"),
            1
        );
    }

    #[test]
    fn metric_namespace_changes_metric_names() {
        let metrics = recorded(|| async {
            let store = instrumented().with_metric_namespace("accounts");
            let _ = store.load(Uuid::new_v4(), LoadOptions::latest()).await;
        });

        assert_eq!(counter_value(&metrics, "accounts_load_total", "not_found"), Some(1));
        assert!(!has_metric(&metrics, "aggregatestore_load_total"));
    }

    #[test]
    fn stacked_layers_record_under_their_own_namespace() {
        let metrics = recorded(|| async {
            let store =
                InstrumentedStore::<Counter, _>::new(instrumented().with_metric_namespace("inner"))
                    .with_metric_namespace("outer");
            let _ = store.load(Uuid::new_v4(), LoadOptions::latest()).await;
        });

        assert_eq!(counter_value(&metrics, "inner_load_total", "not_found"), Some(1));
        assert_eq!(counter_value(&metrics, "outer_load_total", "not_found"), Some(1));
    }

    #[test]
    fn event_store_records_append_and_read() {
        let metrics = recorded(|| async {
            let store = InstrumentedEventStore::new(MemoryEventStore::new());
            let stream = StreamId::new("counter", Uuid::new_v4());
            let event = || encode_event::<Counter>(&CounterEvent::Opened).unwrap();

            let version = store
                .append(&stream, ExpectedVersion::NoStream, vec![event()])
                .await
                .unwrap();
            assert_eq!(version, 1);
            let err = store
                .append(&stream, ExpectedVersion::NoStream, vec![event()])
                .await
                .unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(store.read(&stream, 0).await.unwrap().len(), 1);
        });

        assert_eq!(counter_value(&metrics, "eventstore_append_total", "success"), Some(1));
        assert_eq!(counter_value(&metrics, "eventstore_append_total", "conflict"), Some(1));
        assert_eq!(counter_value(&metrics, "eventstore_read_total", "success"), Some(1));
        assert_eq!(
            histogram_samples(&metrics, "eventstore_read_duration_seconds", "success"),
            1
        );
    }

    #[test]
    fn snapshot_store_labels_misses() {
        let metrics = recorded(|| async {
            let store = InstrumentedSnapshotStore::new(MemorySnapshotStore::new());
            let stream = StreamId::new("counter", Uuid::new_v4());

            assert!(store.read_latest(&stream, None).await.unwrap().is_none());
            store
                .write(Snapshot {
                    stream_id: stream.clone(),
                    version: 3,
                    state: serde_json::json!({}),
                    taken_at: Utc::now(),
                })
                .await
                .unwrap();
            let latest = store.read_latest(&stream, None).await.unwrap();
            assert_eq!(latest.map(|s| s.version), Some(3));
        });

        assert_eq!(counter_value(&metrics, "snapshotstore_read_latest_total", "miss"), Some(1));
        assert_eq!(
            counter_value(&metrics, "snapshotstore_read_latest_total", "success"),
            Some(1)
        );
        assert_eq!(counter_value(&metrics, "snapshotstore_write_total", "success"), Some(1));
    }

    #[tokio::test]
    async fn forwards_results_unchanged() {
        let store = instrumented();
        let mut agg = store.new_aggregate(None).unwrap();
        agg.append(vec![CounterEvent::Opened, CounterEvent::Added { amount: 9 }])
            .unwrap();
        store.save(&mut agg).await.unwrap();
        assert_eq!(agg.committed_version(), 2);

        let loaded = store.load(agg.id(), LoadOptions::latest()).await.unwrap();
        assert_eq!(loaded.entity().value, 9);
    }

    #[tokio::test]
    async fn forwards_errors_unchanged() {
        let store = instrumented();
        let err = store
            .load(Uuid::new_v4(), LoadOptions::latest())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let agg = store.new_aggregate(None).unwrap();
        let mut stale = agg.clone();
        let mut fresh = agg;
        fresh.append(vec![CounterEvent::Opened]).unwrap();
        store.save(&mut fresh).await.unwrap();
        stale.append(vec![CounterEvent::Added { amount: 1 }]).unwrap();
        assert!(store.save(&mut stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn instrumented_stores_compose_under_the_aggregate_chain() {
        let events = InstrumentedEventStore::new(MemoryEventStore::new());
        let store = InstrumentedStore::<Counter, _>::new(EventSourcedStore::new(events).unwrap());

        let mut agg = store.new_aggregate(None).unwrap();
        agg.append(vec![CounterEvent::Opened]).unwrap();
        store.save(&mut agg).await.unwrap();
        let loaded = store.load(agg.id(), LoadOptions::latest()).await.unwrap();
        assert_eq!(loaded.version(), 1);
    }
}
