//! Crate-level error types for aggregate persistence and outbox dispatch.

use uuid::Uuid;

use crate::event::StreamId;
use crate::event_store::ExpectedVersion;

/// A boxed, thread-safe error used for domain rejections, hook failures,
/// and outbox handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by entities, aggregates, and every aggregate store layer.
///
/// Decorators forward the inner layer's `StoreError` unchanged; only the
/// hookable store adds a variant of its own ([`StoreError::Hook`]).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed input: an undeclared event type or an event whose
    /// serialized form does not match its tag.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A backing store returned data that breaks its own guarantees, such
    /// as a stream with a version gap or a stored event type the entity
    /// does not declare.
    #[error("corrupted stream {stream}: {reason}")]
    Corrupted {
        /// The stream that was being replayed.
        stream: StreamId,
        /// What was wrong with it.
        reason: String,
    },

    /// The entity's reducer rejected an event.
    ///
    /// Wraps the domain-specific error, forwarding its `Display` so that
    /// messages such as "account already deleted" reach the caller as-is.
    #[error(transparent)]
    Domain(BoxError),

    /// No events (and no snapshot) exist for the requested stream.
    #[error("stream not found: {stream}")]
    NotFound {
        /// The stream that was looked up.
        stream: StreamId,
    },

    /// The stream's version did not match the expected version on append.
    ///
    /// The caller must reload the aggregate and retry if it wishes to
    /// proceed.
    #[error("concurrency conflict on {stream}: expected version {expected}, actual {actual}")]
    Conflict {
        /// The stream that was written to.
        stream: StreamId,
        /// The version the writer expected the stream to be at.
        expected: ExpectedVersion,
        /// The version the stream was actually at.
        actual: u64,
    },

    /// Disk I/O failure in a backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backing store could not be reached.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// An event payload or snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A before-hook rejected the operation before the inner store ran.
    #[error("hook rejected operation: {0}")]
    Hook(#[source] BoxError),
}

impl StoreError {
    /// Wrap a domain error returned by an entity's reducer.
    pub fn domain<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Domain(Box::new(err))
    }

    /// Returns `true` for an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` when the requested stream does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failure of a single outbox handler for a single item.
///
/// Isolated per handler: it is logged by the processor and leaves the
/// handler pending on the item, never failing the dispatch pass.
#[derive(Debug, thiserror::Error)]
#[error("outbox handler '{handler}' failed for event {event_id}: {source}")]
pub struct HandlerError {
    /// Name of the handler that failed.
    pub handler: String,
    /// Event the handler was invoked for.
    pub event_id: Uuid,
    /// The handler's own error.
    #[source]
    pub source: BoxError,
}
