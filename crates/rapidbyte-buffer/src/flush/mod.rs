//! Flushing buffered batches to the destination.
//!
//! [`DestinationFlush`] is the pluggable capability a connector implements.
//! [`workers::FlushWorkers`] drives it from a pool of tokio tasks, choosing
//! streams with [`detect::DetectStreamToFlush`] and guarding per-stream
//! ordering with [`running::RunningFlushWorkers`].

pub mod detect;
pub mod running;
pub mod workers;

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use rapidbyte_types::checkpoint::EmittedCheckpoint;
use rapidbyte_types::error::ConnectorError;
use rapidbyte_types::message::RecordItem;
use rapidbyte_types::stream::StreamKey;

use crate::checkpoint::CheckpointTracker;
use crate::error::{BufferError, Result};
use crate::failure::FlushFailure;
use crate::result::SummaryCollector;

/// Destination-specific persistence of record batches.
pub trait DestinationFlush: Send + Sync + 'static {
    /// Preferred batch size; `take` cuts batches up to this many bytes.
    fn optimal_batch_size_bytes(&self) -> u64;

    /// Queue size at which a stream becomes eligible for flushing without
    /// memory pressure or staleness.
    fn queue_flush_threshold_bytes(&self) -> u64 {
        self.optimal_batch_size_bytes()
    }

    /// Durably write `records` for `stream`. Returning `Ok` acknowledges
    /// every record in the slice.
    fn flush(
        &self,
        stream: &StreamKey,
        records: &[RecordItem],
    ) -> impl Future<Output = std::result::Result<(), ConnectorError>> + Send;
}

/// Receives checkpoints once every record they cover has been flushed.
pub trait CheckpointSink: Send + Sync + 'static {
    fn emit(&self, checkpoint: EmittedCheckpoint);
}

impl CheckpointSink for mpsc::UnboundedSender<EmittedCheckpoint> {
    fn emit(&self, checkpoint: EmittedCheckpoint) {
        if let Err(err) = self.send(checkpoint) {
            tracing::warn!(
                marker_id = err.0.id,
                "Checkpoint receiver dropped; checkpoint not delivered"
            );
        }
    }
}

/// Polls the tracker and forwards emittable checkpoints to the sink.
///
/// Poll and delivery happen under one lock so concurrent callers cannot
/// reorder checkpoints.
pub(crate) struct CheckpointEmitter<S> {
    tracker: Arc<CheckpointTracker>,
    failure: Arc<FlushFailure>,
    sink: Arc<S>,
    summary: Arc<SummaryCollector>,
    lock: Mutex<()>,
}

impl<S: CheckpointSink> CheckpointEmitter<S> {
    pub(crate) fn new(
        tracker: Arc<CheckpointTracker>,
        failure: Arc<FlushFailure>,
        sink: Arc<S>,
        summary: Arc<SummaryCollector>,
    ) -> Self {
        Self {
            tracker,
            failure,
            sink,
            summary,
            lock: Mutex::new(()),
        }
    }

    /// Emit every checkpoint that is ready. Returns how many were emitted.
    pub(crate) fn emit_ready(&self) -> Result<usize> {
        let _guard = self.lock.lock().map_err(|_| BufferError::LockPoisoned)?;
        if self.failure.is_failed() {
            return Ok(0);
        }
        let ready = self.tracker.poll_emittable()?;
        let count = ready.len();
        for checkpoint in ready {
            tracing::debug!(
                marker_id = checkpoint.id,
                stream = ?checkpoint.stream.as_ref().map(ToString::to_string),
                record_count = checkpoint.record_count,
                "Emitting checkpoint"
            );
            self.summary.record_checkpoint();
            self.sink.emit(checkpoint);
        }
        Ok(count)
    }
}
