//! Choosing which stream a worker flushes next.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use rapidbyte_types::stream::StreamKey;

use super::running::{RunningFlushWorkers, StreamClaim};
use crate::buffer::{BufferDequeue, QueueSnapshot};
use crate::error::Result;

/// Picks an unclaimed stream that is worth flushing.
///
/// A stream is eligible when its queue reaches the flush threshold, memory is
/// under pressure, its head record is older than `max_age`, or the pool is
/// draining. Eligible streams are tried largest queue first.
#[derive(Debug)]
pub struct DetectStreamToFlush {
    dequeue: BufferDequeue,
    running: Arc<RunningFlushWorkers>,
    threshold_bytes: u64,
    max_age: Duration,
}

impl DetectStreamToFlush {
    #[must_use]
    pub fn new(
        dequeue: BufferDequeue,
        running: Arc<RunningFlushWorkers>,
        threshold_bytes: u64,
        max_age: Duration,
    ) -> Self {
        Self {
            dequeue,
            running,
            threshold_bytes,
            max_age,
        }
    }

    fn is_eligible(&self, queue: &QueueSnapshot, under_pressure: bool, draining: bool) -> bool {
        draining
            || under_pressure
            || queue.size_bytes >= self.threshold_bytes
            || queue.oldest_record_age >= self.max_age
    }

    /// Eligible streams, largest first, including claimed ones.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the queue mutex was poisoned.
    pub fn eligible_streams(&self, draining: bool) -> Result<Vec<StreamKey>> {
        let under_pressure = self.dequeue.memory().is_under_pressure();
        let mut queues: Vec<QueueSnapshot> = self
            .dequeue
            .snapshot()?
            .into_iter()
            .filter(|q| self.is_eligible(q, under_pressure, draining))
            .collect();
        queues.sort_by_key(|q| (Reverse(q.size_bytes), Reverse(q.oldest_record_age)));
        Ok(queues.into_iter().map(|q| q.stream).collect())
    }

    /// Claim the best eligible stream no other worker is flushing.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a queue or claim mutex was poisoned.
    pub fn claim_next(&self, draining: bool) -> Result<Option<StreamClaim>> {
        for stream in self.eligible_streams(draining)? {
            if let Some(claim) = self.running.try_claim(&stream)? {
                return Ok(Some(claim));
            }
        }
        Ok(None)
    }
}
