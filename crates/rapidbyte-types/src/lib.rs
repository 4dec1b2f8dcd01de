//! Shared data model for the Rapidbyte destination buffer.
//!
//! Holds the types that cross the boundary between the buffering engine and
//! destination connectors: stream keys, buffered items, checkpoint markers,
//! and the structured connector error returned by flushes. This crate has no
//! async runtime dependency so connector crates can use it directly.

pub mod checkpoint;
pub mod error;
pub mod message;
pub mod stream;
