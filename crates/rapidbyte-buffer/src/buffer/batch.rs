use rapidbyte_types::message::RecordItem;
use rapidbyte_types::stream::StreamKey;

use super::queue::QueuedRecord;
use crate::checkpoint::BatchId;
use crate::memory::MemoryReservation;

/// Contiguous run of records taken from the head of one stream's queue.
///
/// The batch keeps the records' memory reserved until it is closed or
/// dropped, so data in flight still counts against the budget.
#[derive(Debug)]
pub struct MessageBatch {
    id: BatchId,
    stream: StreamKey,
    records: Vec<RecordItem>,
    size_bytes: u64,
    reservation: Option<MemoryReservation>,
}

impl MessageBatch {
    pub(crate) fn new(id: BatchId, stream: StreamKey, queued: Vec<QueuedRecord>) -> Self {
        let mut records = Vec::with_capacity(queued.len());
        let mut reservation: Option<MemoryReservation> = None;
        let mut size_bytes = 0u64;
        for q in queued {
            size_bytes += q.record.size_bytes;
            records.push(q.record);
            match reservation.as_mut() {
                Some(r) => r.merge(q.reservation),
                None => reservation = Some(q.reservation),
            }
        }
        Self {
            id,
            stream,
            records,
            size_bytes,
            reservation,
        }
    }

    #[must_use]
    pub fn id(&self) -> BatchId {
        self.id
    }

    #[must_use]
    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    #[must_use]
    pub fn records(&self) -> &[RecordItem] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Reserved bytes still held by this batch.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.as_ref().map_or(0, MemoryReservation::bytes)
    }

    /// Release the batch's memory. Dropping the batch does the same.
    pub fn close(mut self) {
        if let Some(reservation) = self.reservation.take() {
            reservation.release();
        }
    }
}
