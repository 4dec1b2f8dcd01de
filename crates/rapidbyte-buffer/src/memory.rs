//! Global memory budget for buffered items.
//!
//! Every buffered record and marker holds a [`MemoryReservation`] for its
//! estimated size. Reservations wait (backpressure) while the budget is
//! exhausted and are granted first-blocked-first-served. Bytes go back to the
//! budget when the reservation is dropped, so a batch releases its memory on
//! every exit path of a flush.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{BufferError, Result};

/// Default fraction of the budget above which the buffer counts as under
/// memory pressure.
pub const DEFAULT_PRESSURE_RATIO: f64 = 0.9;

/// Tracks `used_bytes <= capacity_bytes` for the whole buffer.
#[derive(Debug)]
pub struct MemoryAccountant {
    semaphore: Arc<Semaphore>,
    capacity_bytes: u64,
    pressure_ratio: f64,
    waiting: AtomicUsize,
}

/// Bytes held against the budget. Released on drop.
#[derive(Debug)]
#[must_use = "dropping a reservation immediately returns its bytes"]
pub struct MemoryReservation {
    permit: OwnedSemaphorePermit,
    bytes: u64,
}

impl MemoryReservation {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Fold `other` into this reservation. Both must come from the same
    /// accountant.
    pub fn merge(&mut self, other: MemoryReservation) {
        self.bytes += other.bytes;
        self.permit.merge(other.permit);
    }

    /// Return the bytes to the budget now.
    pub fn release(self) {
        drop(self);
    }
}

/// Decrements the waiter count when a blocked `reserve` finishes or is
/// cancelled.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryAccountant {
    /// Create an accountant with `capacity_bytes` of budget.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the capacity is zero or larger than the
    /// semaphore can represent.
    pub fn new(capacity_bytes: u64) -> Result<Self> {
        Self::with_pressure_ratio(capacity_bytes, DEFAULT_PRESSURE_RATIO)
    }

    /// Like [`MemoryAccountant::new`] with a custom pressure threshold.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero or oversized capacity, or a ratio
    /// outside `(0, 1]`.
    pub fn with_pressure_ratio(capacity_bytes: u64, pressure_ratio: f64) -> Result<Self> {
        if capacity_bytes == 0 {
            return Err(BufferError::InvalidConfig(
                "memory budget must be > 0".to_string(),
            ));
        }
        let permits = usize::try_from(capacity_bytes)
            .ok()
            .filter(|p| *p <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| {
                BufferError::InvalidConfig(format!(
                    "memory budget of {capacity_bytes} bytes is too large"
                ))
            })?;
        if !(pressure_ratio > 0.0 && pressure_ratio <= 1.0) {
            return Err(BufferError::InvalidConfig(format!(
                "memory pressure ratio must be in (0, 1], got {pressure_ratio}"
            )));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            capacity_bytes,
            pressure_ratio,
            waiting: AtomicUsize::new(0),
        })
    }

    fn permits_for(&self, bytes: u64) -> Result<u32> {
        if bytes > self.capacity_bytes {
            return Err(BufferError::ItemTooLarge {
                bytes,
                capacity: self.capacity_bytes,
            });
        }
        u32::try_from(bytes).map_err(|_| BufferError::ItemTooLarge {
            bytes,
            capacity: u64::from(u32::MAX),
        })
    }

    /// Reserve `bytes`, waiting until they fit in the budget.
    ///
    /// # Errors
    ///
    /// Returns `ItemTooLarge` immediately if `bytes` can never fit, or
    /// `Closed` if the accountant is closed while waiting.
    pub async fn reserve(&self, bytes: u64) -> Result<MemoryReservation> {
        let permits = self.permits_for(bytes)?;
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_many_owned(permits) {
            return Ok(MemoryReservation { permit, bytes });
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&self.waiting);
        tracing::trace!(
            bytes,
            used_bytes = self.used_bytes(),
            capacity_bytes = self.capacity_bytes,
            "Memory budget exhausted, waiting for flush"
        );
        let permit = Arc::clone(&self.semaphore)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| BufferError::Closed)?;
        Ok(MemoryReservation { permit, bytes })
    }

    /// Reserve `bytes` only if they fit right now.
    ///
    /// # Errors
    ///
    /// Returns `ItemTooLarge` if `bytes` can never fit, or `Closed` after
    /// [`MemoryAccountant::close`].
    pub fn try_reserve(&self, bytes: u64) -> Result<Option<MemoryReservation>> {
        let permits = self.permits_for(bytes)?;
        match Arc::clone(&self.semaphore).try_acquire_many_owned(permits) {
            Ok(permit) => Ok(Some(MemoryReservation { permit, bytes })),
            Err(tokio::sync::TryAcquireError::NoPermits) => Ok(None),
            Err(tokio::sync::TryAcquireError::Closed) => Err(BufferError::Closed),
        }
    }

    /// Wake every waiting reserver with `Closed` and refuse new reservations.
    /// Outstanding reservations still release normally.
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.semaphore.available_permits() as u64
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.available_bytes())
    }

    /// Number of reservers currently blocked on the budget.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// True when reservers are blocked or usage crossed the pressure ratio.
    /// Workers use this to flush undersized queues instead of deadlocking.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn is_under_pressure(&self) -> bool {
        self.waiting() > 0
            || self.used_bytes() as f64 >= self.capacity_bytes as f64 * self.pressure_ratio
    }
}
