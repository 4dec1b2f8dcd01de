//! Per-stream FIFO buffers and the producer/consumer views over them.
//!
//! [`BufferEnqueue`] is the ingestion side: it reserves memory and appends.
//! [`BufferDequeue`] is the worker side: it reports which streams have data
//! and cuts [`MessageBatch`]es off the head of a stream's queue.

mod batch;
mod dequeue;
mod enqueue;
mod queue;

use std::sync::Arc;

pub use batch::MessageBatch;
pub use dequeue::{BufferDequeue, QueueSnapshot};
pub use enqueue::BufferEnqueue;

use crate::checkpoint::CheckpointTracker;
use crate::memory::MemoryAccountant;
use queue::StreamBuffers;

/// Build the enqueue and dequeue views over one shared set of stream queues.
#[must_use]
pub fn new_buffer(
    memory: Arc<MemoryAccountant>,
    tracker: Arc<CheckpointTracker>,
) -> (BufferEnqueue, BufferDequeue) {
    let buffers = Arc::new(StreamBuffers::default());
    let enqueue = BufferEnqueue::new(
        Arc::clone(&buffers),
        Arc::clone(&memory),
        Arc::clone(&tracker),
    );
    let dequeue = BufferDequeue::new(buffers, memory, tracker);
    (enqueue, dequeue)
}
