//! Streams with a take+flush currently in flight.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use rapidbyte_types::stream::StreamKey;

use crate::error::{BufferError, Result};

/// Set of streams claimed by a worker. At most one claim per stream exists,
/// which keeps batches of one stream flushing in FIFO order.
#[derive(Debug, Default)]
pub struct RunningFlushWorkers {
    claimed: Mutex<BTreeSet<StreamKey>>,
}

impl RunningFlushWorkers {
    fn lock(&self) -> Result<MutexGuard<'_, BTreeSet<StreamKey>>> {
        self.claimed.lock().map_err(|_| BufferError::LockPoisoned)
    }

    /// Claim `stream` for the caller. `None` if another worker holds it.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the claim mutex was poisoned.
    pub fn try_claim(self: &Arc<Self>, stream: &StreamKey) -> Result<Option<StreamClaim>> {
        if !self.lock()?.insert(stream.clone()) {
            return Ok(None);
        }
        Ok(Some(StreamClaim {
            running: Arc::clone(self),
            stream: stream.clone(),
        }))
    }

    /// # Errors
    ///
    /// Returns `LockPoisoned` if the claim mutex was poisoned.
    pub fn is_claimed(&self, stream: &StreamKey) -> Result<bool> {
        Ok(self.lock()?.contains(stream))
    }

    /// Snapshot of the claimed streams.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the claim mutex was poisoned.
    pub fn in_flight(&self) -> Result<BTreeSet<StreamKey>> {
        Ok(self.lock()?.clone())
    }
}

/// Exclusive right to take and flush one stream. Released on drop.
#[derive(Debug)]
pub struct StreamClaim {
    running: Arc<RunningFlushWorkers>,
    stream: StreamKey,
}

impl StreamClaim {
    #[must_use]
    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        match self.running.claimed.lock() {
            Ok(mut claimed) => {
                claimed.remove(&self.stream);
            }
            Err(_) => tracing::error!(stream = %self.stream, "Claim set poisoned on release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_claim_per_stream() {
        let running = Arc::new(RunningFlushWorkers::default());
        let users = StreamKey::new("public", "users");
        let orders = StreamKey::new("public", "orders");

        let claim = running.try_claim(&users).unwrap().unwrap();
        assert!(running.try_claim(&users).unwrap().is_none());
        let other = running.try_claim(&orders).unwrap().unwrap();
        assert_eq!(running.in_flight().unwrap().len(), 2);
        assert_eq!(claim.stream(), &users);

        drop(claim);
        assert!(!running.is_claimed(&users).unwrap());
        assert!(running.is_claimed(&orders).unwrap());
        assert!(running.try_claim(&users).unwrap().is_some());
        drop(other);
    }
}
