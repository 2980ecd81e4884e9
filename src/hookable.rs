//! Ordered lifecycle callbacks around load and save.

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::entity::Entity;
use crate::error::{BoxError, StoreError};
use crate::store::{AggregateStore, LoadOptions};

type LoadHook = Box<dyn Fn(Uuid) -> Result<(), BoxError> + Send + Sync>;
type AggregateHook<E> = Box<dyn Fn(&Aggregate<E>) -> Result<(), BoxError> + Send + Sync>;

/// Decorator that runs callbacks before and after load and save.
///
/// Callbacks for each lifecycle point run synchronously in registration
/// order. A failing before-callback aborts the operation before the inner
/// store is called and is returned as [`StoreError::Hook`]. A failing
/// after-callback is logged; the caller still receives the inner result.
pub struct HookableStore<E: Entity, I> {
    inner: I,
    before_load: Vec<LoadHook>,
    after_load: Vec<AggregateHook<E>>,
    before_save: Vec<AggregateHook<E>>,
    after_save: Vec<AggregateHook<E>>,
}

impl<E: Entity, I> fmt::Debug for HookableStore<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookableStore")
            .field("before_load", &self.before_load.len())
            .field("after_load", &self.after_load.len())
            .field("before_save", &self.before_save.len())
            .field("after_save", &self.after_save.len())
            .finish_non_exhaustive()
    }
}

impl<E: Entity, I: AggregateStore<E>> HookableStore<E, I> {
    /// Wrap `inner` with no callbacks registered.
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            before_load: Vec::new(),
            after_load: Vec::new(),
            before_save: Vec::new(),
            after_save: Vec::new(),
        }
    }

    /// Register a callback invoked with the id before every load.
    pub fn before_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(Uuid) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before_load.push(Box::new(hook));
        self
    }

    /// Register a callback invoked with the loaded aggregate after every
    /// successful load.
    pub fn after_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Aggregate<E>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.after_load.push(Box::new(hook));
        self
    }

    /// Register a callback invoked with the aggregate, unsaved events
    /// included, before every save.
    pub fn before_save<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Aggregate<E>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before_save.push(Box::new(hook));
        self
    }

    /// Register a callback invoked with the saved aggregate after every
    /// successful save.
    pub fn after_save<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Aggregate<E>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.after_save.push(Box::new(hook));
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &I {
        &self.inner
    }
}

fn run_after<E: Entity>(point: &'static str, hooks: &[AggregateHook<E>], aggregate: &Aggregate<E>) {
    for (index, hook) in hooks.iter().enumerate() {
        if let Err(e) = hook(aggregate) {
            tracing::warn!(
                hook = point,
                index,
                aggregate_id = %aggregate.id(),
                error = %e,
                "after-hook failed"
            );
        }
    }
}

#[async_trait]
impl<E: Entity, I: AggregateStore<E>> AggregateStore<E> for HookableStore<E, I> {
    fn new_aggregate(&self, id: Option<Uuid>) -> Result<Aggregate<E>, StoreError> {
        self.inner.new_aggregate(id)
    }

    async fn load(&self, id: Uuid, options: LoadOptions) -> Result<Aggregate<E>, StoreError> {
        for hook in &self.before_load {
            hook(id).map_err(StoreError::Hook)?;
        }
        let aggregate = self.inner.load(id, options).await?;
        run_after("after_load", &self.after_load, &aggregate);
        Ok(aggregate)
    }

    async fn hydrate(
        &self,
        aggregate: &mut Aggregate<E>,
        options: LoadOptions,
    ) -> Result<(), StoreError> {
        self.inner.hydrate(aggregate, options).await
    }

    async fn save(&self, aggregate: &mut Aggregate<E>) -> Result<(), StoreError> {
        for hook in &self.before_save {
            hook(&*aggregate).map_err(StoreError::Hook)?;
        }
        self.inner.save(aggregate).await?;
        run_after("after_save", &self.after_save, aggregate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_fixtures::{Counter, CounterEvent};
    use crate::event_sourced::EventSourcedStore;
    use crate::event_store::MemoryEventStore;
    use std::sync::{Arc, Mutex};

    type Base = EventSourcedStore<Counter, MemoryEventStore>;

    fn base() -> Base {
        EventSourcedStore::new(MemoryEventStore::new()).unwrap()
    }

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        label: &'static str,
    ) -> impl Fn(&Aggregate<Counter>) -> Result<(), BoxError> + Send + Sync + 'static {
        let log = log.clone();
        move |agg| {
            log.lock().unwrap().push(format!("{label}@{}", agg.version()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = HookableStore::new(base())
            .before_save(recorder(&log, "first"))
            .before_save(recorder(&log, "second"))
            .after_save(recorder(&log, "after"));

        let mut agg = store.new_aggregate(None).unwrap();
        agg.append(vec![CounterEvent::Opened]).unwrap();
        store.save(&mut agg).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first@1", "second@1", "after@1"]
        );
    }

    #[tokio::test]
    async fn failing_before_save_aborts_without_touching_inner() {
        let events = MemoryEventStore::new();
        let store = HookableStore::new(Base::new(events.clone()).unwrap())
            .before_save(|_| Err("frozen".into()));

        let mut agg = store.new_aggregate(None).unwrap();
        agg.append(vec![CounterEvent::Opened]).unwrap();
        let err = store.save(&mut agg).await.unwrap_err();

        assert!(matches!(err, StoreError::Hook(_)));
        assert!(err.to_string().contains("frozen"));
        assert!(agg.has_unsaved_events());
        assert_eq!(
            events
                .stream_version(&crate::event::StreamId::of::<Counter>(agg.id()))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn failing_before_load_aborts() {
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        let store = HookableStore::new(base())
            .before_load(|_| Err("denied".into()))
            .after_load(move |_| {
                *seen.lock().unwrap() += 1;
                Ok(())
            });

        let err = store
            .load(Uuid::new_v4(), LoadOptions::latest())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Hook(_)));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_after_hooks_do_not_change_result() {
        let store = HookableStore::new(base())
            .after_save(|_| Err("audit offline".into()))
            .after_load(|_| Err("cache offline".into()));

        let mut agg = store.new_aggregate(None).unwrap();
        agg.append(vec![CounterEvent::Added { amount: 2 }]).unwrap();
        store.save(&mut agg).await.expect("after-hook failure is swallowed");
        assert_eq!(agg.committed_version(), 1);

        let loaded = store.load(agg.id(), LoadOptions::latest()).await.unwrap();
        assert_eq!(loaded.entity().value, 2);
    }

    #[tokio::test]
    async fn inner_errors_pass_through_unchanged() {
        let store = HookableStore::new(base());
        let err = store
            .load(Uuid::new_v4(), LoadOptions::latest())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
