//! The event store contract and an in-memory implementation.
//!
//! An event store is a per-stream, append-only log. Appends are
//! all-or-nothing and guarded by an [`ExpectedVersion`]; versions within a
//! stream start at 1 and have no gaps.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::event::{ProposedEvent, StoredEvent, StreamId};
use crate::outbox::Outbox;

/// Optimistic concurrency guard for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Returns `true` if a stream currently at `current` satisfies this
    /// expectation. A stream with no events is at version 0.
    pub fn matches(self, current: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current == 0,
            Self::Exact(v) => current == v,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Durable, per-stream append-only event log.
///
/// Implementations must make [`append`](EventStore::append) atomic per
/// stream: either every event is stored with consecutive versions, or none
/// is. Dropping an in-flight call must not leave a partial append behind.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append events to a stream.
    ///
    /// # Arguments
    ///
    /// * `stream` - The stream to append to.
    /// * `expected` - The version the caller expects the stream to be at.
    /// * `events` - Events to append, in order.
    ///
    /// # Returns
    ///
    /// The stream's version after the append (its last event's version).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if `expected` does not match the
    /// stream's current version. Backing-store failures are returned as
    /// [`StoreError::Io`] or [`StoreError::Unavailable`].
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, StoreError>;

    /// Read a stream's events with a version strictly greater than
    /// `after_version`, in ascending version order.
    ///
    /// Passing 0 reads the whole stream. A stream with no events yields an
    /// empty vector, not an error.
    async fn read(
        &self,
        stream: &StreamId,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError>;
}

#[async_trait]
impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, StoreError> {
        (**self).append(stream, expected, events).await
    }

    async fn read(
        &self,
        stream: &StreamId,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        (**self).read(stream, after_version).await
    }
}

/// An [`EventStore`] held in process memory.
///
/// Cloning shares the underlying streams. When an [`Outbox`] is attached,
/// every appended event is staged into it inside the same critical section
/// as the append, so an outbox item exists if and only if its event was
/// committed.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    streams: Arc<Mutex<HashMap<StreamId, Vec<StoredEvent>>>>,
    outbox: Option<Outbox>,
}

impl MemoryEventStore {
    /// Create an empty store with no outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an outbox that receives every committed event.
    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// The attached outbox, if any.
    pub fn outbox(&self) -> Option<&Outbox> {
        self.outbox.as_ref()
    }

    /// Current version of a stream (0 if it has no events).
    pub async fn stream_version(&self, stream: &StreamId) -> u64 {
        let streams = self.streams.lock().await;
        streams.get(stream).map_or(0, |events| events.len() as u64)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, StoreError> {
        // Both locks are taken before anything is mutated; nothing below
        // the second lock awaits.
        let mut streams = self.streams.lock().await;
        let mut staging = match &self.outbox {
            Some(outbox) => Some(outbox.begin().await),
            None => None,
        };

        let current = streams.get(stream).map_or(0, |log| log.len() as u64);
        if !expected.matches(current) {
            tracing::debug!(stream = %stream, %expected, actual = current, "append conflict");
            return Err(StoreError::Conflict {
                stream: stream.clone(),
                expected,
                actual: current,
            });
        }
        if events.is_empty() {
            return Ok(current);
        }

        let recorded_at = Utc::now();
        let stored: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(event, version)| StoredEvent {
                event_id: event.event_id,
                stream_id: stream.clone(),
                version,
                event_type: event.event_type,
                payload: event.payload,
                recorded_at,
            })
            .collect();

        if let Some(tx) = staging.as_mut() {
            for event in &stored {
                tx.stage(event);
            }
        }

        let log = streams.entry(stream.clone()).or_default();
        log.extend(stored);
        let new_version = log.len() as u64;

        if let Some(tx) = staging {
            tx.commit();
        }

        tracing::debug!(stream = %stream, from = current, to = new_version, "events appended");
        Ok(new_version)
    }

    async fn read(
        &self,
        stream: &StreamId,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let streams = self.streams.lock().await;
        let events = streams
            .get(stream)
            .map(|log| {
                log.iter()
                    .filter(|event| event.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{OutboxHandler, OutboxItem};
    use crate::error::BoxError;
    use uuid::Uuid;

    fn proposed(event_type: &str) -> ProposedEvent {
        ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_owned(),
            payload: serde_json::json!({ "amount": 1 }),
        }
    }

    fn stream() -> StreamId {
        StreamId::new("counter", Uuid::new_v4())
    }

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(9));
        assert!(ExpectedVersion::NoStream.matches(0));
        assert!(!ExpectedVersion::NoStream.matches(1));
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
    }

    #[test]
    fn expected_version_display() {
        assert_eq!(ExpectedVersion::Exact(7).to_string(), "7");
        assert_eq!(ExpectedVersion::NoStream.to_string(), "no stream");
        assert_eq!(ExpectedVersion::Any.to_string(), "any");
    }

    #[tokio::test]
    async fn append_assigns_gap_free_versions() {
        let store = MemoryEventStore::new();
        let s = stream();

        let v = store
            .append(&s, ExpectedVersion::NoStream, vec![proposed("Added"), proposed("Added")])
            .await
            .expect("first append");
        assert_eq!(v, 2);

        let v = store
            .append(&s, ExpectedVersion::Exact(2), vec![proposed("Removed")])
            .await
            .expect("second append");
        assert_eq!(v, 3);

        let events = store.read(&s, 0).await.expect("read");
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(events[2].event_type, "Removed");
    }

    #[tokio::test]
    async fn read_after_version_returns_tail() {
        let store = MemoryEventStore::new();
        let s = stream();
        store
            .append(&s, ExpectedVersion::Any, vec![proposed("A"), proposed("B"), proposed("C")])
            .await
            .unwrap();

        let tail = store.read(&s, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].version, 3);
        assert!(store.read(&s, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_unknown_stream_is_empty() {
        let store = MemoryEventStore::new();
        assert!(store.read(&stream(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicting_append_leaves_stream_untouched() {
        let store = MemoryEventStore::new();
        let s = stream();
        store
            .append(&s, ExpectedVersion::Exact(0), vec![proposed("A")])
            .await
            .unwrap();

        let err = store
            .append(&s, ExpectedVersion::Exact(0), vec![proposed("B")])
            .await
            .unwrap_err();

        match err {
            StoreError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, ExpectedVersion::Exact(0));
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(store.stream_version(&s).await, 1);
    }

    #[tokio::test]
    async fn empty_append_returns_current_version() {
        let store = MemoryEventStore::new();
        let s = stream();
        store
            .append(&s, ExpectedVersion::Any, vec![proposed("A")])
            .await
            .unwrap();
        let v = store
            .append(&s, ExpectedVersion::Exact(1), Vec::new())
            .await
            .unwrap();
        assert_eq!(v, 1);
    }

    struct Noop;

    #[async_trait]
    impl OutboxHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn handle(&self, _item: &OutboxItem) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn append_stages_outbox_items_only_on_commit() {
        let outbox = Outbox::builder()
            .register_handler("A", Arc::new(Noop))
            .build();
        let store = MemoryEventStore::new().with_outbox(outbox.clone());
        let s = stream();

        store
            .append(&s, ExpectedVersion::NoStream, vec![proposed("A"), proposed("A")])
            .await
            .unwrap();
        assert_eq!(outbox.len().await, 2);

        let err = store
            .append(&s, ExpectedVersion::NoStream, vec![proposed("A")])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(outbox.len().await, 2);

        let items = outbox.pending_items().await;
        assert_eq!(items[0].version, 1);
        assert_eq!(items[1].version, 2);
        assert!(items.iter().all(|item| item.pending.contains("noop")));
    }
}
