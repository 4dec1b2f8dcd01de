//! Asynchronous ingestion buffer and flush engine for Rapidbyte destinations.
//!
//! Records are enqueued per stream under a global memory budget, drained by a
//! pool of flush workers through a pluggable [`DestinationFlush`], and
//! checkpoint markers are released to a [`CheckpointSink`] only after every
//! record they cover has been flushed.

#![warn(clippy::pedantic)]

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod failure;
pub mod flush;
pub mod memory;
pub mod result;

// Re-export public API for convenience
pub use buffer::{BufferDequeue, BufferEnqueue, MessageBatch};
pub use checkpoint::CheckpointTracker;
pub use config::types::BufferConfig;
pub use consumer::BufferedConsumer;
pub use error::{BufferError, Result};
pub use failure::FlushFailure;
pub use flush::{CheckpointSink, DestinationFlush};
pub use memory::{MemoryAccountant, MemoryReservation};
pub use result::FlushSummary;
