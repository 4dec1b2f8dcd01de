//! Items handed to the buffer by the ingestion path.

use bytes::Bytes;

use crate::checkpoint::CheckpointScope;

/// One serialized record. The payload is opaque to the buffer; only its size
/// matters for memory accounting and batching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordItem {
    pub payload: Bytes,
    /// Estimated in-memory size. Defaults to the payload length.
    pub size_bytes: u64,
}

impl RecordItem {
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let size_bytes = payload.len() as u64;
        Self {
            payload,
            size_bytes,
        }
    }

    /// Override the size estimate (e.g. when the caller accounts for
    /// deserialized overhead rather than wire bytes).
    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

/// A checkpoint marker as received from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerItem {
    pub scope: CheckpointScope,
    pub state: serde_json::Value,
    pub size_bytes: u64,
}

impl MarkerItem {
    /// Marker covering the stream it is enqueued on.
    #[must_use]
    pub fn stream(state: serde_json::Value) -> Self {
        Self::new(CheckpointScope::Stream, state)
    }

    /// Marker covering every stream.
    #[must_use]
    pub fn global(state: serde_json::Value) -> Self {
        Self::new(CheckpointScope::global(), state)
    }

    /// Sized by the length of the serialized state.
    #[must_use]
    pub fn new(scope: CheckpointScope, state: serde_json::Value) -> Self {
        let size_bytes = serde_json::to_vec(&state).map_or(0, |v| v.len() as u64);
        Self {
            scope,
            state,
            size_bytes,
        }
    }

    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

/// Anything the ingestion path can enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedItem {
    Record(RecordItem),
    Marker(MarkerItem),
}

impl BufferedItem {
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Record(r) => r.size_bytes,
            Self::Marker(m) => m.size_bytes,
        }
    }
}

impl From<RecordItem> for BufferedItem {
    fn from(value: RecordItem) -> Self {
        Self::Record(value)
    }
}

impl From<MarkerItem> for BufferedItem {
    fn from(value: MarkerItem) -> Self {
        Self::Marker(value)
    }
}
