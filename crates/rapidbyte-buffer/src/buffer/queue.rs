//! Shared queue storage behind the enqueue and dequeue views.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::time::Instant;

use rapidbyte_types::message::RecordItem;
use rapidbyte_types::stream::StreamKey;

use crate::checkpoint::StateId;
use crate::error::{BufferError, Result};
use crate::memory::MemoryReservation;

#[derive(Debug)]
pub(crate) struct QueuedRecord {
    pub(crate) record: RecordItem,
    pub(crate) state_id: StateId,
    pub(crate) reservation: MemoryReservation,
    pub(crate) enqueued_at: Instant,
}

/// FIFO of one stream's pending records.
#[derive(Debug, Default)]
pub(crate) struct StreamQueue {
    records: VecDeque<QueuedRecord>,
    size_bytes: u64,
}

impl StreamQueue {
    pub(crate) fn push(&mut self, record: QueuedRecord) {
        self.size_bytes += record.record.size_bytes;
        self.records.push_back(record);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub(crate) fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub(crate) fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.records.front().map(|r| r.enqueued_at)
    }

    /// Pop the longest head prefix whose total size fits `max_bytes`. The
    /// head record is always taken so oversized records still make progress.
    pub(crate) fn take_prefix(&mut self, max_bytes: u64) -> Vec<QueuedRecord> {
        let mut taken = Vec::new();
        let mut total = 0u64;
        while let Some(front) = self.records.front() {
            let size = front.record.size_bytes;
            if !taken.is_empty() && total.saturating_add(size) > max_bytes {
                break;
            }
            total = total.saturating_add(size);
            if let Some(record) = self.records.pop_front() {
                taken.push(record);
            }
        }
        self.size_bytes = self.size_bytes.saturating_sub(total);
        taken
    }

    /// Put a prefix returned by [`take_prefix`](Self::take_prefix) back at
    /// the head, ahead of anything enqueued since.
    pub(crate) fn restore_prefix(&mut self, taken: Vec<QueuedRecord>) {
        for record in taken.into_iter().rev() {
            self.size_bytes += record.record.size_bytes;
            self.records.push_front(record);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamBuffers {
    queues: Mutex<HashMap<StreamKey, StreamQueue>>,
}

impl StreamBuffers {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, HashMap<StreamKey, StreamQueue>>> {
        self.queues.lock().map_err(|_| BufferError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAccountant;

    fn queue_of(memory: &MemoryAccountant, sizes: &[u64]) -> StreamQueue {
        let mut queue = StreamQueue::default();
        for (i, size) in sizes.iter().enumerate() {
            queue.push(QueuedRecord {
                record: RecordItem::new(format!("r{i}")).with_size(*size),
                state_id: 0,
                reservation: memory.try_reserve(*size).unwrap().unwrap(),
                enqueued_at: Instant::now(),
            });
        }
        queue
    }

    #[test]
    fn take_prefix_respects_max_bytes() {
        let memory = MemoryAccountant::new(10_000).unwrap();
        let mut queue = queue_of(&memory, &[10, 10, 10, 10]);
        let taken = queue.take_prefix(25);
        assert_eq!(taken.len(), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.size_bytes(), 20);
    }

    #[test]
    fn take_prefix_always_takes_head() {
        let memory = MemoryAccountant::new(10_000).unwrap();
        let mut queue = queue_of(&memory, &[500, 10]);
        let taken = queue.take_prefix(100);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].record.size_bytes, 500);
        assert_eq!(queue.size_bytes(), 10);
    }

    #[test]
    fn take_prefix_preserves_fifo_order() {
        let memory = MemoryAccountant::new(10_000).unwrap();
        let mut queue = queue_of(&memory, &[1, 1, 1]);
        let payloads: Vec<_> = queue
            .take_prefix(u64::MAX)
            .into_iter()
            .map(|r| r.record.payload)
            .collect();
        assert_eq!(payloads, vec!["r0", "r1", "r2"]);
        assert!(queue.is_empty());
        assert_eq!(queue.oldest_enqueued_at(), None);
    }

    #[test]
    fn restore_prefix_goes_back_ahead_of_later_records() {
        let memory = MemoryAccountant::new(10_000).unwrap();
        let mut queue = queue_of(&memory, &[1, 2, 3]);
        let taken = queue.take_prefix(3);
        assert_eq!(taken.len(), 2);
        queue.push(QueuedRecord {
            record: RecordItem::new("late").with_size(4),
            state_id: 1,
            reservation: memory.try_reserve(4).unwrap().unwrap(),
            enqueued_at: Instant::now(),
        });

        queue.restore_prefix(taken);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.size_bytes(), 10);
        let payloads: Vec<_> = queue
            .take_prefix(u64::MAX)
            .into_iter()
            .map(|r| r.record.payload)
            .collect();
        assert_eq!(payloads, vec!["r0", "r1", "r2", "late"]);
    }
}
