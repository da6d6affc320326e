//! Event store abstraction and the in-memory reference implementation.
//!
//! The engine persists through the [`EventStore`] trait and assumes
//! idempotent append plus strict per-stream ordering; the hosting process
//! supplies the durable implementation. [`InMemoryEventStore`] is the
//! reference implementation used by tests and ephemeral nodes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::event::RecordedEvent;

/// Errors that can occur during event store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the stream moved past the expected
    /// version, typically because another writer appended concurrently.
    #[error("version conflict on stream {stream_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        /// Stream where the conflict occurred.
        stream_id: Uuid,
        /// Version the writer expected.
        expected: u64,
        /// Actual current version.
        actual: u64,
    },

    /// The requested stream does not exist.
    #[error("stream {0} not found")]
    StreamNotFound(Uuid),

    /// Backend-specific failure (connection, disk, serialization).
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Concurrency expectation for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the stream's current version.
    Any,
    /// Append only if the stream currently has exactly this many events.
    Exact(u64),
}

/// A persisted aggregate snapshot.
///
/// The `state` value is the serialized [`AggregateSnapshot`]
/// (state + pending schedules + version) for the owning aggregate type.
///
/// [`AggregateSnapshot`]: crate::AggregateSnapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Stream the snapshot belongs to.
    pub stream_id: Uuid,
    /// Stream version the snapshot captures.
    pub version: u64,
    /// Serialized snapshot payload.
    pub state: serde_json::Value,
}

/// Append-only event storage with per-stream ordering.
///
/// # Contract
///
/// - `append` with [`ExpectedVersion::Exact`] must fail with
///   [`StoreError::VersionConflict`] when the stream length differs.
/// - Appending an event whose ID is already in the stream must be a no-op
///   (idempotent append).
/// - `load` returns events in append order.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch of events, returning the new stream version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] on an expectation mismatch,
    /// or [`StoreError::Backend`] on storage failure.
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<RecordedEvent>,
    ) -> Result<u64, StoreError>;

    /// Load every event of a stream in append order.
    ///
    /// An unknown stream loads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn load(&self, stream_id: Uuid) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Persist a snapshot, replacing any previous one for the stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), StoreError>;

    /// Load the latest snapshot for a stream, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn load_snapshot(&self, stream_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError>;
}

/// In-memory event store for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<Uuid, Vec<RecordedEvent>>>,
    snapshots: RwLock<HashMap<Uuid, SnapshotRecord>>,
}

impl InMemoryEventStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events currently in a stream.
    pub async fn stream_len(&self, stream_id: Uuid) -> usize {
        self.streams
            .read()
            .await
            .get(&stream_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Event type tags of a stream, in append order.
    pub async fn event_types(&self, stream_id: Uuid) -> Vec<String> {
        self.streams
            .read()
            .await
            .get(&stream_id)
            .map(|events| events.iter().map(|e| e.event_type.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<RecordedEvent>,
    ) -> Result<u64, StoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(stream_id).or_default();

        if let ExpectedVersion::Exact(expected) = expected {
            let actual = stream.len() as u64;
            if actual != expected {
                return Err(StoreError::VersionConflict {
                    stream_id,
                    expected,
                    actual,
                });
            }
        }

        for event in events {
            // Idempotent append: a redelivered event ID is skipped.
            if stream.iter().any(|e| e.event_id == event.event_id) {
                continue;
            }
            stream.push(event);
        }
        Ok(stream.len() as u64)
    }

    async fn load(&self, stream_id: Uuid) -> Result<Vec<RecordedEvent>, StoreError> {
        Ok(self
            .streams
            .read()
            .await
            .get(&stream_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.stream_id, snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, stream_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.snapshots.read().await.get(&stream_id).cloned())
    }
}

/// Store wrapper that fails appends on demand, for fault-path tests.
#[cfg(test)]
pub(crate) struct FailingStore {
    inner: InMemoryEventStore,
    fail_appends: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            fail_appends: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_appends(&self, fail: bool) {
        self.fail_appends
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl EventStore for FailingStore {
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<RecordedEvent>,
    ) -> Result<u64, StoreError> {
        if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Backend("injected append failure".to_owned()));
        }
        self.inner.append(stream_id, expected, events).await
    }

    async fn load(&self, stream_id: Uuid) -> Result<Vec<RecordedEvent>, StoreError> {
        self.inner.load(stream_id).await
    }

    async fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), StoreError> {
        self.inner.save_snapshot(snapshot).await
    }

    async fn load_snapshot(&self, stream_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        self.inner.load_snapshot(stream_id).await
    }
}
