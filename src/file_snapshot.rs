//! File-backed snapshot store.
//!
//! Snapshots are stored as JSON files at
//! `<base_dir>/snapshots/<entity_type>/<entity_id>/<version>.json`.
//! Writes are atomic via a temp-rename pattern to prevent corruption
//! from crashes mid-write.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::event::StreamId;
use crate::snapshot::{Snapshot, SnapshotStore};

/// A [`SnapshotStore`] keeping one JSON file per snapshot.
///
/// Every snapshot is retained. Unreadable or corrupt files are logged and
/// skipped, so they behave like a cache miss.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    base_dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at `base_dir`. Directories are created lazily
    /// on the first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Directory holding every snapshot of one stream.
///
/// # Returns
///
/// `<base_dir>/snapshots/<entity_type>/<entity_id>`
pub fn stream_dir(base_dir: &Path, stream: &StreamId) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(stream.entity_type())
        .join(stream.id().to_string())
}

/// Path of the snapshot file for one stream at one version.
pub fn snapshot_path(base_dir: &Path, stream: &StreamId, version: u64) -> PathBuf {
    stream_dir(base_dir, stream).join(format!("{version}.json"))
}

fn write_snapshot(base_dir: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let path = snapshot_path(base_dir, &snapshot.stream_id, snapshot.version);
    std::fs::create_dir_all(stream_dir(base_dir, &snapshot.stream_id))?;

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Versions present on disk for a stream, newest first.
fn list_versions(dir: &Path) -> io::Result<Vec<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let name = entry?.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        if let Ok(version) = stem.parse::<u64>() {
            versions.push(version);
        }
    }
    versions.sort_unstable_by(|a, b| b.cmp(a));
    Ok(versions)
}

fn read_latest_snapshot(
    base_dir: &Path,
    stream: &StreamId,
    max_version: Option<u64>,
) -> Result<Option<Snapshot>, StoreError> {
    let bound = max_version.unwrap_or(u64::MAX);
    for version in list_versions(&stream_dir(base_dir, stream))?
        .into_iter()
        .filter(|v| *v <= bound)
    {
        let path = snapshot_path(base_dir, stream, version);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snap) if snap.stream_id == *stream && snap.version == version => {
                return Ok(Some(snap));
            }
            Ok(snap) => {
                tracing::warn!(
                    path = %path.display(),
                    found_stream = %snap.stream_id,
                    found_version = snap.version,
                    "snapshot file does not match its location; skipping"
                );
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
            }
        }
    }
    Ok(None)
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(io::Error::other(format!("snapshot task failed: {e}"))))?
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn write(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let base_dir = self.base_dir.clone();
        blocking(move || write_snapshot(&base_dir, &snapshot)).await
    }

    async fn read_latest(
        &self,
        stream: &StreamId,
        max_version: Option<u64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let base_dir = self.base_dir.clone();
        let stream = stream.clone();
        blocking(move || read_latest_snapshot(&base_dir, &stream, max_version)).await
    }
}
