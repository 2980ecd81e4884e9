//! Durable staging of committed events for at-least-once delivery.
//!
//! An [`Outbox`] holds one [`OutboxItem`] per committed event that has at
//! least one registered handler. Items are created by the event store in the
//! same critical section as the append ([`Outbox::begin`]) and are removed
//! only once every handler pending on them has acknowledged success.
//!
//! Workers take items with [`Outbox::claim`], which grants a time-limited
//! lease so that no two workers handle the same item at once. A worker
//! acknowledges each handler separately ([`Outbox::ack`]) and then hands the
//! item back with [`Outbox::release`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::BoxError;
use crate::event::{StoredEvent, StreamId};

/// A consumer of committed events.
///
/// Handlers may be invoked more than once for the same item and must be
/// idempotent. Returning `Err` leaves the handler pending on the item, and
/// it will be retried on a later pass.
#[async_trait]
pub trait OutboxHandler: Send + Sync + 'static {
    /// Unique name of this handler. Recorded in each item's pending set.
    fn name(&self) -> &str;

    /// Deliver one committed event.
    async fn handle(&self, item: &OutboxItem) -> Result<(), BoxError>;
}

/// A committed event awaiting delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxItem {
    /// Identity of the committed event.
    pub event_id: Uuid,
    /// Stream the event was appended to.
    pub stream_id: StreamId,
    /// Version of the event within its stream.
    pub version: u64,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload of the event.
    pub payload: serde_json::Value,
    /// When the event was committed.
    pub recorded_at: DateTime<Utc>,
    /// Names of the handlers that have not yet succeeded for this item.
    pub pending: BTreeSet<String>,
    /// Number of completed delivery passes that left handlers pending.
    pub attempts: u32,
}

/// An item leased to one worker together with the handlers still pending
/// on it.
pub struct ClaimedItem {
    /// Snapshot of the item at claim time.
    pub item: OutboxItem,
    /// Handlers to invoke, in registration order.
    pub handlers: Vec<Arc<dyn OutboxHandler>>,
}

impl fmt::Debug for ClaimedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedItem")
            .field("item", &self.item)
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug)]
struct Entry {
    item: OutboxItem,
    lease: Option<Lease>,
    not_before: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    worker: usize,
    until: Instant,
}

impl Entry {
    fn claimable(&self, now: Instant) -> bool {
        let leased = self.lease.is_some_and(|lease| lease.until > now);
        let backing_off = self.not_before.is_some_and(|at| at > now);
        !leased && !backing_off
    }

    /// The item is still leased to `worker`, expired or not, because no
    /// other worker has claimed it since.
    fn leased_to(&self, worker: usize) -> bool {
        self.lease.is_some_and(|lease| lease.worker == worker)
    }
}

#[derive(Debug, Default)]
struct OutboxState {
    // Keyed by staging sequence so claims are served in commit order.
    entries: BTreeMap<u64, Entry>,
    index: HashMap<Uuid, u64>,
    next_seq: u64,
}

struct OutboxInner {
    handlers: HashMap<String, Vec<Arc<dyn OutboxHandler>>>,
    state: Mutex<OutboxState>,
    notify: Notify,
}

/// Builder for an [`Outbox`]. Handlers are registered here, before the
/// outbox is attached to a store or a processor is started.
#[derive(Default)]
pub struct OutboxBuilder {
    handlers: HashMap<String, Vec<Arc<dyn OutboxHandler>>>,
}

impl OutboxBuilder {
    /// Register a handler for one event type.
    ///
    /// A handler registered twice for the same event type under the same
    /// name replaces the earlier registration.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Tag of the events the handler receives.
    /// * `handler` - The handler to invoke for each such event.
    pub fn register_handler(
        mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn OutboxHandler>,
    ) -> Self {
        let event_type = event_type.into();
        let handlers = self.handlers.entry(event_type.clone()).or_default();
        if let Some(existing) = handlers.iter_mut().find(|h| h.name() == handler.name()) {
            tracing::warn!(
                event_type = %event_type,
                handler = handler.name(),
                "replacing outbox handler registered under the same name"
            );
            *existing = handler;
        } else {
            handlers.push(handler);
        }
        self
    }

    /// Freeze the registrations into an [`Outbox`].
    pub fn build(self) -> Outbox {
        Outbox {
            inner: Arc::new(OutboxInner {
                handlers: self.handlers,
                state: Mutex::new(OutboxState::default()),
                notify: Notify::new(),
            }),
        }
    }
}

/// Shared staging area for committed events. Cloning is cheap and shares
/// the same items.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.inner.handlers.keys().collect();
        types.sort();
        f.debug_struct("Outbox").field("event_types", &types).finish()
    }
}

impl Outbox {
    /// Start registering handlers.
    pub fn builder() -> OutboxBuilder {
        OutboxBuilder::default()
    }

    /// Names of the handlers registered for `event_type`, in registration
    /// order.
    pub fn handler_names(&self, event_type: &str) -> Vec<String> {
        self.inner
            .handlers
            .get(event_type)
            .map(|hs| hs.iter().map(|h| h.name().to_owned()).collect())
            .unwrap_or_default()
    }

    /// Lock the outbox for staging items alongside an event append.
    ///
    /// Staged items become visible only when the returned transaction is
    /// committed; dropping it discards them.
    pub async fn begin(&self) -> OutboxTransaction<'_> {
        OutboxTransaction {
            outbox: &self.inner,
            state: self.inner.state.lock().await,
            staged: Vec::new(),
        }
    }

    /// Lease the oldest claimable item to `worker` for `lease`.
    ///
    /// An item is claimable when it is not leased (or its lease expired) and
    /// its retry backoff has elapsed.
    pub async fn claim(&self, worker: usize, lease: Duration) -> Option<ClaimedItem> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        let entry = state
            .entries
            .values_mut()
            .find(|entry| entry.claimable(now))?;

        if let Some(previous) = entry.lease {
            tracing::warn!(
                event_id = %entry.item.event_id,
                previous_worker = previous.worker,
                worker,
                "reclaiming outbox item with expired lease"
            );
        }
        entry.lease = Some(Lease {
            worker,
            until: now + lease,
        });

        let handlers = self
            .inner
            .handlers
            .get(&entry.item.event_type)
            .map(|hs| {
                hs.iter()
                    .filter(|h| entry.item.pending.contains(h.name()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Some(ClaimedItem {
            item: entry.item.clone(),
            handlers,
        })
    }

    /// Record that `handler`, run by `worker`, succeeded for the item
    /// `event_id`.
    ///
    /// The success is recorded even if `worker` lost its lease meanwhile, so
    /// the handler is not invoked again. Unknown items and handlers are
    /// ignored; acknowledging twice is harmless.
    pub async fn ack(&self, worker: usize, event_id: Uuid, handler: &str) {
        let mut state = self.inner.state.lock().await;
        let Some(seq) = state.index.get(&event_id).copied() else {
            return;
        };
        if let Some(entry) = state.entries.get_mut(&seq) {
            if !entry.leased_to(worker) {
                tracing::debug!(worker, event_id = %event_id, handler, "ack after lease was lost");
            }
            entry.item.pending.remove(handler);
        }
    }

    /// Give back an item claimed by `worker`.
    ///
    /// If no handler is pending the item is retired and `true` is returned.
    /// Otherwise its attempt count is incremented and it becomes claimable
    /// again after `retry_after`.
    ///
    /// A worker whose lease expired and was taken over by another worker no
    /// longer owns the item: its release changes nothing and returns
    /// `false`.
    pub async fn release(&self, worker: usize, event_id: Uuid, retry_after: Duration) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(seq) = state.index.get(&event_id).copied() else {
            return false;
        };
        let Some(entry) = state.entries.get_mut(&seq) else {
            return false;
        };
        if !entry.leased_to(worker) {
            tracing::warn!(
                worker,
                event_id = %event_id,
                holder = ?entry.lease.map(|lease| lease.worker),
                "ignoring release of outbox item leased to another worker"
            );
            return false;
        }

        if entry.item.pending.is_empty() {
            state.entries.remove(&seq);
            state.index.remove(&event_id);
            return true;
        }

        entry.item.attempts += 1;
        entry.lease = None;
        entry.not_before = Some(Instant::now() + retry_after);
        false
    }

    /// Items not yet retired, in commit order.
    pub async fn pending_items(&self) -> Vec<OutboxItem> {
        let state = self.inner.state.lock().await;
        state.entries.values().map(|e| e.item.clone()).collect()
    }

    /// Number of items not yet retired.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// Returns `true` if every item has been retired.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait until an item is committed or `notify_all` is called.
    pub(crate) async fn notified(&self) {
        self.inner.notify.notified().await;
    }

    /// Wake every task waiting in [`notified`](Outbox::notified).
    pub(crate) fn notify_all(&self) {
        self.inner.notify.notify_waiters();
    }
}

/// Items staged alongside one event append.
///
/// Holds the outbox lock for its whole lifetime.
/// [`stage`](OutboxTransaction::stage) and
/// [`commit`](OutboxTransaction::commit) never suspend.
pub struct OutboxTransaction<'a> {
    outbox: &'a OutboxInner,
    state: MutexGuard<'a, OutboxState>,
    staged: Vec<OutboxItem>,
}

impl OutboxTransaction<'_> {
    /// Stage an item for `event` with every handler registered for its
    /// type pending. Events with no registered handler produce no item.
    pub fn stage(&mut self, event: &StoredEvent) {
        let Some(handlers) = self.outbox.handlers.get(&event.event_type) else {
            return;
        };
        if handlers.is_empty() {
            return;
        }

        self.staged.push(OutboxItem {
            event_id: event.event_id,
            stream_id: event.stream_id.clone(),
            version: event.version,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            recorded_at: event.recorded_at,
            pending: handlers.iter().map(|h| h.name().to_owned()).collect(),
            attempts: 0,
        });
    }

    /// Make every staged item visible to workers.
    pub fn commit(mut self) {
        if self.staged.is_empty() {
            return;
        }

        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        for item in staged {
            let seq = self.state.next_seq;
            self.state.next_seq += 1;
            self.state.index.insert(item.event_id, seq);
            self.state.entries.insert(
                seq,
                Entry {
                    item,
                    lease: None,
                    not_before: None,
                },
            );
        }
        drop(self.state);

        tracing::debug!(items = count, "outbox items committed");
        self.outbox.notify.notify_waiters();
    }
}
