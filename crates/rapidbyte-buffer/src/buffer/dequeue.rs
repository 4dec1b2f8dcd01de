//! Worker side of the buffer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rapidbyte_types::stream::StreamKey;

use super::batch::MessageBatch;
use super::queue::StreamBuffers;
use crate::checkpoint::{CheckpointTracker, StateId};
use crate::error::Result;
use crate::memory::MemoryAccountant;

/// Point-in-time view of one non-empty stream queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub stream: StreamKey,
    pub size_bytes: u64,
    pub records: u64,
    pub oldest_record_age: Duration,
}

/// Consumer-facing view over every stream queue.
#[derive(Debug, Clone)]
pub struct BufferDequeue {
    buffers: Arc<StreamBuffers>,
    memory: Arc<MemoryAccountant>,
    tracker: Arc<CheckpointTracker>,
}

impl BufferDequeue {
    pub(crate) fn new(
        buffers: Arc<StreamBuffers>,
        memory: Arc<MemoryAccountant>,
        tracker: Arc<CheckpointTracker>,
    ) -> Self {
        Self {
            buffers,
            memory,
            tracker,
        }
    }

    /// Streams with at least one pending record.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn buffered_streams(&self) -> Result<BTreeSet<StreamKey>> {
        Ok(self
            .buffers
            .lock()?
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// Pending bytes for `stream`, `None` if unknown or empty.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn queue_size_bytes(&self, stream: &StreamKey) -> Result<Option<u64>> {
        Ok(self
            .buffers
            .lock()?
            .get(stream)
            .filter(|q| !q.is_empty())
            .map(super::queue::StreamQueue::size_bytes))
    }

    /// Pending record count for `stream`, `None` if unknown or empty.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn queue_size_records(&self, stream: &StreamKey) -> Result<Option<u64>> {
        Ok(self
            .buffers
            .lock()?
            .get(stream)
            .filter(|q| !q.is_empty())
            .map(super::queue::StreamQueue::len))
    }

    /// Time the head record of `stream` has been waiting.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn oldest_record_age(&self, stream: &StreamKey) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .buffers
            .lock()?
            .get(stream)
            .and_then(super::queue::StreamQueue::oldest_enqueued_at)
            .map(|at| now.saturating_duration_since(at)))
    }

    /// Bytes pending across all streams (excludes batches in flight).
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn total_queued_bytes(&self) -> Result<u64> {
        Ok(self.buffers.lock()?.values().map(|q| q.size_bytes()).sum())
    }

    /// Records pending across all streams.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn total_queued_records(&self) -> Result<u64> {
        Ok(self.buffers.lock()?.values().map(|q| q.len()).sum())
    }

    /// Snapshot every non-empty queue under a single lock.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn snapshot(&self) -> Result<Vec<QueueSnapshot>> {
        let now = Instant::now();
        Ok(self
            .buffers
            .lock()?
            .iter()
            .filter_map(|(stream, q)| {
                q.oldest_enqueued_at().map(|at| QueueSnapshot {
                    stream: stream.clone(),
                    size_bytes: q.size_bytes(),
                    records: q.len(),
                    oldest_record_age: now.saturating_duration_since(at),
                })
            })
            .collect())
    }

    /// Remove a FIFO prefix of `stream` totalling at most `max_bytes` (always
    /// at least one record). Returns `None` if the stream has nothing queued.
    ///
    /// The batch keeps its memory reserved until it is closed or dropped.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a buffer mutex was poisoned. Records are
    /// put back at the head of the queue when the batch cannot be registered.
    pub fn take(&self, stream: &StreamKey, max_bytes: u64) -> Result<Option<MessageBatch>> {
        let taken = {
            let mut queues = self.buffers.lock()?;
            match queues.get_mut(stream) {
                Some(queue) => queue.take_prefix(max_bytes),
                None => return Ok(None),
            }
        };
        if taken.is_empty() {
            return Ok(None);
        }

        let mut counts: Vec<(StateId, u64)> = Vec::new();
        for record in &taken {
            match counts.last_mut() {
                Some((id, n)) if *id == record.state_id => *n += 1,
                _ => counts.push((record.state_id, 1)),
            }
        }
        let batch_id = match self.tracker.register_batch(counts) {
            Ok(id) => id,
            Err(err) => {
                if let Some(queue) = self.buffers.lock()?.get_mut(stream) {
                    queue.restore_prefix(taken);
                }
                return Err(err);
            }
        };
        let batch = MessageBatch::new(batch_id, stream.clone(), taken);
        tracing::trace!(
            stream = %stream,
            batch_id,
            records = batch.len(),
            bytes = batch.size_bytes(),
            "Took batch from stream queue"
        );
        Ok(Some(batch))
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryAccountant {
        &self.memory
    }

    #[must_use]
    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }
}
