//! Buffer error types.

use std::time::Duration;

use rapidbyte_types::error::ConnectorError;

use crate::checkpoint::BatchId;

/// Errors produced by the buffer, its workers, and the consumer facade.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The destination flush failed. The first such error fails the run.
    #[error("flush failed: {0}")]
    Flush(#[from] ConnectorError),

    /// Draining on close did not finish in time.
    #[error("buffer drain did not complete within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    /// A single item can never fit the memory budget.
    #[error("item of {bytes} bytes exceeds memory budget of {capacity} bytes")]
    ItemTooLarge { bytes: u64, capacity: u64 },

    /// Rejected buffer configuration.
    #[error("invalid buffer config: {0}")]
    InvalidConfig(String),

    /// Per-stream and global checkpoint markers were mixed in one run.
    #[error("cannot mix per-stream and global checkpoint markers in one run")]
    MixedCheckpointScopes,

    /// A batch completion was reported twice or for a batch never taken.
    #[error("unknown or already completed batch {0}")]
    UnknownBatch(BatchId),

    /// Ingestion after the buffer was closed.
    #[error("buffer is closed")]
    Closed,

    /// `start` was called on a consumer that is already running.
    #[error("consumer already started")]
    AlreadyStarted,

    /// Internal mutex was poisoned by a panicked thread.
    #[error("buffer lock poisoned")]
    LockPoisoned,

    /// Host-side failure outside the flush capability (e.g. a worker panic).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl BufferError {
    /// The connector error behind a flush failure.
    #[must_use]
    pub fn as_connector_error(&self) -> Option<&ConnectorError> {
        match self {
            Self::Flush(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, BufferError>;
