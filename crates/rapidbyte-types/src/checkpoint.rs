//! Checkpoint marker types.
//!
//! A checkpoint (state) marker says "everything before this point is safe to
//! consider durably written". The buffer holds each marker back until every
//! record it covers has been flushed, then hands an [`EmittedCheckpoint`] to
//! the output sink.

use serde::{Deserialize, Serialize};

use crate::stream::StreamKey;

/// Identifier assigned to a marker when it enters the buffer. Increases in
/// enqueue order.
pub type MarkerId = u64;

/// Which records a checkpoint marker covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointScope {
    /// Covers the records of the stream the marker was enqueued on.
    Stream,
    /// Covers records across streams. `streams` lists the streams the source
    /// reported in the global state; whether the buffer waits on only these
    /// or on every stream is a buffer-side policy.
    Global {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        streams: Vec<StreamKey>,
    },
}

impl CheckpointScope {
    #[must_use]
    pub fn global() -> Self {
        Self::Global {
            streams: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global { .. })
    }
}

/// Lifecycle of a marker inside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    /// Waiting on records that have not been flushed yet.
    Pending,
    /// Every covered record was flushed; the marker was emitted.
    Flushed,
    /// The run aborted before the marker was satisfied. Never emitted.
    Abandoned,
}

/// A marker released to the output sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedCheckpoint {
    pub id: MarkerId,
    pub scope: CheckpointScope,
    /// Stream the marker was enqueued on (`None` for global markers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamKey>,
    /// Opaque state payload, passed through untouched.
    pub state: serde_json::Value,
    /// Number of records this marker covers, all of them flushed.
    pub record_count: u64,
}
