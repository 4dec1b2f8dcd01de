//! Ingestion side of the buffer.

use std::sync::Arc;

use tokio::time::Instant;

use rapidbyte_types::message::BufferedItem;
use rapidbyte_types::stream::StreamKey;

use super::queue::{QueuedRecord, StreamBuffers};
use crate::checkpoint::CheckpointTracker;
use crate::error::Result;
use crate::memory::MemoryAccountant;

/// Appends records to per-stream queues and hands markers to the checkpoint
/// tracker, reserving memory for both first.
#[derive(Debug, Clone)]
pub struct BufferEnqueue {
    buffers: Arc<StreamBuffers>,
    memory: Arc<MemoryAccountant>,
    tracker: Arc<CheckpointTracker>,
}

impl BufferEnqueue {
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

    /// Buffer `item` for `stream`. Waits while the memory budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `ItemTooLarge` if the item can never fit the budget, `Closed`
    /// if the budget was closed while waiting, or a checkpoint tracking error
    /// for markers.
    pub async fn enqueue(&self, stream: StreamKey, item: BufferedItem) -> Result<()> {
        let reservation = self.memory.reserve(item.size_bytes()).await?;
        match item {
            BufferedItem::Record(record) => {
                let state_id = self.tracker.assign_record(&stream)?;
                let mut queues = self.buffers.lock()?;
                queues.entry(stream).or_default().push(QueuedRecord {
                    record,
                    state_id,
                    reservation,
                    enqueued_at: Instant::now(),
                });
            }
            BufferedItem::Marker(marker) => {
                self.tracker
                    .track_marker(&stream, marker, Some(reservation))?;
            }
        }
        Ok(())
    }
}
