//! Snapshot contract, snapshot policies, and an in-memory snapshot store.
//!
//! A snapshot caches an entity's full state at one stream version so that a
//! load only replays the events after it. Snapshots are an optimization:
//! losing one, or failing to read one, must never change what a load
//! returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::event::StreamId;

/// A point-in-time capture of an entity's state.
///
/// `version` is the number of events folded into `state`, so replay
/// resumes with the event at `version + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The stream the snapshot belongs to.
    pub stream_id: StreamId,
    /// The stream version at capture time.
    pub version: u64,
    /// Serialized entity state.
    pub state: serde_json::Value,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Storage for snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot. A snapshot at the same version as an existing
    /// one replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`] if the
    /// snapshot could not be stored.
    async fn write(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Return the newest snapshot of `stream` whose version is at most
    /// `max_version` (or the newest overall when `max_version` is `None`).
    ///
    /// # Returns
    ///
    /// `Ok(None)` when no qualifying snapshot exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] for unexpected backing-store failures.
    async fn read_latest(
        &self,
        stream: &StreamId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError>;
}

#[async_trait]
impl<S: SnapshotStore + ?Sized> SnapshotStore for Arc<S> {
    async fn write(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        (**self).write(snapshot).await
    }

    async fn read_latest(
        &self,
        stream: &StreamId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        (**self).read_latest(stream, max_version).await
    }
}

/// Decides when a new snapshot should be taken.
pub trait SnapshotPolicy: Send + Sync + 'static {
    /// Returns `true` if a snapshot should be written at `new_version`,
    /// given the version of the latest existing snapshot (0 if none).
    fn should_snapshot(&self, last_snapshot_version: u64, new_version: u64) -> bool;
}

/// Snapshot once at least `every` events have been committed since the
/// last snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCountPolicy {
    every: u64,
}

impl EventCountPolicy {
    /// Snapshot every `every` events. Zero snapshots after every save.
    pub fn new(every: u64) -> Self {
        Self { every }
    }

    /// The configured event count.
    pub fn every(&self) -> u64 {
        self.every
    }
}

impl SnapshotPolicy for EventCountPolicy {
    fn should_snapshot(&self, last_snapshot_version: u64, new_version: u64) -> bool {
        new_version.saturating_sub(last_snapshot_version) >= self.every
    }
}

/// A [`SnapshotStore`] held in process memory.
///
/// Retains every snapshot written. Cloning shares the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<StreamId, BTreeMap<u64, Snapshot>>>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot of `stream`, oldest first.
    pub async fn snapshots(&self, stream: &StreamId) -> Vec<Snapshot> {
        let snapshots = self.snapshots.lock().await;
        snapshots
            .get(stream)
            .map(|by_version| by_version.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn write(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().await;
        snapshots
            .entry(snapshot.stream_id.clone())
            .or_default()
            .insert(snapshot.version, snapshot);
        Ok(())
    }

    async fn read_latest(
        &self,
        stream: &StreamId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.lock().await;
        let latest = snapshots.get(stream).and_then(|by_version| {
            by_version
                .range(..=max_version.unwrap_or(u64::MAX))
                .next_back()
                .map(|(_, snapshot)| snapshot.clone())
        });
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn snapshot(stream: &StreamId, version: u64) -> Snapshot {
        Snapshot {
            stream_id: stream.clone(),
            version,
            state: serde_json::json!({ "value": version }),
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn event_count_policy_threshold() {
        let policy = EventCountPolicy::new(3);
        assert!(!policy.should_snapshot(0, 2));
        assert!(policy.should_snapshot(0, 3));
        assert!(policy.should_snapshot(0, 4));
        assert!(!policy.should_snapshot(3, 5));
        assert!(policy.should_snapshot(3, 6));
    }

    #[test]
    fn event_count_policy_zero_fires_on_every_check() {
        let policy = EventCountPolicy::new(0);
        assert!(policy.should_snapshot(4, 4));
        assert!(policy.should_snapshot(4, 5));
    }

    #[test]
    fn event_count_policy_tolerates_newer_snapshot() {
        let policy = EventCountPolicy::new(3);
        assert!(!policy.should_snapshot(9, 4));
    }

    #[tokio::test]
    async fn read_latest_picks_newest_within_bound() {
        let store = MemorySnapshotStore::new();
        let stream = StreamId::new("counter", Uuid::new_v4());
        for v in [3, 6, 9] {
            store.write(snapshot(&stream, v)).await.unwrap();
        }

        let latest = store.read_latest(&stream, None).await.unwrap().unwrap();
        assert_eq!(latest.version, 9);

        let bounded = store.read_latest(&stream, Some(8)).await.unwrap().unwrap();
        assert_eq!(bounded.version, 6);

        assert!(store.read_latest(&stream, Some(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_latest_unknown_stream_is_none() {
        let store = MemorySnapshotStore::new();
        let stream = StreamId::new("counter", Uuid::new_v4());
        assert!(store.read_latest(&stream, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshots_are_retained_in_order() {
        let store = MemorySnapshotStore::new();
        let stream = StreamId::new("counter", Uuid::new_v4());
        store.write(snapshot(&stream, 6)).await.unwrap();
        store.write(snapshot(&stream, 3)).await.unwrap();

        let versions: Vec<u64> = store
            .snapshots(&stream)
            .await
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![3, 6]);
    }
}
