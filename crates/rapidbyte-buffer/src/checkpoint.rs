//! Checkpoint dependency tracking.
//!
//! Every enqueued record is counted into its stream's open *bucket*. When a
//! marker arrives it closes the bucket(s) it depends on and later records
//! open fresh ones. Flushed batches decrement bucket counters; a marker is
//! emittable once all of its buckets reach zero and no earlier marker of the
//! same lane is still pending.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use rapidbyte_types::checkpoint::{CheckpointScope, EmittedCheckpoint, MarkerId, MarkerStatus};
use rapidbyte_types::message::MarkerItem;
use rapidbyte_types::stream::StreamKey;

use crate::error::{BufferError, Result};
use crate::memory::MemoryReservation;

/// Identifier of a batch handed out by `take`.
pub type BatchId = u64;

/// Identifier of a record bucket.
pub type StateId = u64;

/// Which open buckets a global marker waits on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalCheckpointPolicy {
    /// Wait on every stream's records enqueued before the marker.
    #[default]
    AllStreams,
    /// Wait only on the streams listed in the marker. A marker that lists no
    /// streams falls back to `AllStreams`.
    ListedStreams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointMode {
    PerStream,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Lane {
    Stream(StreamKey),
    Global,
}

#[derive(Debug, Default)]
struct Bucket {
    outstanding: u64,
    records: u64,
}

#[derive(Debug)]
struct PendingMarker {
    id: MarkerId,
    lane: Lane,
    stream: Option<StreamKey>,
    scope: CheckpointScope,
    state: serde_json::Value,
    depends_on: Vec<StateId>,
    record_count: u64,
    // Held until the marker is emitted or abandoned.
    _reservation: Option<MemoryReservation>,
}

#[derive(Debug, Default)]
struct TrackerState {
    mode: Option<CheckpointMode>,
    next_state_id: StateId,
    next_marker_id: MarkerId,
    next_batch_id: BatchId,
    open: HashMap<StreamKey, StateId>,
    buckets: HashMap<StateId, Bucket>,
    pending: VecDeque<PendingMarker>,
    batches: HashMap<BatchId, Vec<(StateId, u64)>>,
    abandoned: HashSet<MarkerId>,
    emitted: u64,
    aborted: bool,
}

/// Maps buffered records to checkpoint markers and decides when a marker is
/// safe to emit.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
    policy: GlobalCheckpointPolicy,
    state: Mutex<TrackerState>,
}

impl CheckpointTracker {
    #[must_use]
    pub fn new(policy: GlobalCheckpointPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, TrackerState>> {
        self.state.lock().map_err(|_| BufferError::LockPoisoned)
    }

    /// Count one record into `stream`'s open bucket and return the bucket.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn assign_record(&self, stream: &StreamKey) -> Result<StateId> {
        let mut state = self.lock_state()?;
        let state = &mut *state;
        let id = match state.open.get(stream) {
            Some(id) => *id,
            None => {
                let id = state.next_state_id;
                state.next_state_id += 1;
                state.open.insert(stream.clone(), id);
                id
            }
        };
        let bucket = state.buckets.entry(id).or_default();
        bucket.outstanding += 1;
        bucket.records += 1;
        Ok(id)
    }

    /// Register a marker enqueued on `stream`, closing the buckets it covers.
    ///
    /// # Errors
    ///
    /// Returns `MixedCheckpointScopes` if the marker's scope differs from the
    /// first marker of the run, or `Closed` after [`abandon_pending`].
    ///
    /// [`abandon_pending`]: CheckpointTracker::abandon_pending
    pub fn track_marker(
        &self,
        stream: &StreamKey,
        marker: MarkerItem,
        reservation: Option<MemoryReservation>,
    ) -> Result<MarkerId> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        if state.aborted {
            return Err(BufferError::Closed);
        }

        let mode = if marker.scope.is_global() {
            CheckpointMode::Global
        } else {
            CheckpointMode::PerStream
        };
        match state.mode {
            None => state.mode = Some(mode),
            Some(existing) if existing != mode => return Err(BufferError::MixedCheckpointScopes),
            Some(_) => {}
        }

        let depends_on: Vec<StateId> = match &marker.scope {
            CheckpointScope::Stream => state.open.remove(stream).into_iter().collect(),
            CheckpointScope::Global { streams }
                if self.policy == GlobalCheckpointPolicy::ListedStreams && !streams.is_empty() =>
            {
                streams
                    .iter()
                    .filter_map(|s| state.open.remove(s))
                    .collect()
            }
            CheckpointScope::Global { .. } => state.open.drain().map(|(_, id)| id).collect(),
        };
        let record_count = depends_on
            .iter()
            .filter_map(|id| state.buckets.get(id))
            .map(|b| b.records)
            .sum();

        let id = state.next_marker_id;
        state.next_marker_id += 1;
        let (lane, marker_stream) = match mode {
            CheckpointMode::PerStream => (Lane::Stream(stream.clone()), Some(stream.clone())),
            CheckpointMode::Global => (Lane::Global, None),
        };
        tracing::debug!(
            marker_id = id,
            stream = %stream,
            global = mode == CheckpointMode::Global,
            buckets = depends_on.len(),
            record_count,
            "Tracking checkpoint marker"
        );
        state.pending.push_back(PendingMarker {
            id,
            lane,
            stream: marker_stream,
            scope: marker.scope,
            state: marker.state,
            depends_on,
            record_count,
            _reservation: reservation,
        });
        Ok(id)
    }

    /// Register a batch drawn from the given buckets.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn register_batch(&self, counts: Vec<(StateId, u64)>) -> Result<BatchId> {
        let mut state = self.lock_state()?;
        let id = state.next_batch_id;
        state.next_batch_id += 1;
        state.batches.insert(id, counts);
        Ok(id)
    }

    /// Mark every record of `batch` as durably flushed.
    ///
    /// # Errors
    ///
    /// Returns `UnknownBatch` if the batch was never registered or was
    /// already reported.
    pub fn record_batch_flushed(&self, batch: BatchId) -> Result<()> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let counts = state
            .batches
            .remove(&batch)
            .ok_or(BufferError::UnknownBatch(batch))?;
        for (id, n) in counts {
            if let Some(bucket) = state.buckets.get_mut(&id) {
                bucket.outstanding = bucket.outstanding.saturating_sub(n);
            }
        }
        Ok(())
    }

    /// Drop a batch that will never be flushed (e.g. discarded after a
    /// failure). Its buckets stay outstanding, so covering markers never
    /// become emittable.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn discard_batch(&self, batch: BatchId) -> Result<()> {
        self.lock_state()?.batches.remove(&batch);
        Ok(())
    }

    /// Remove and return every marker that is now safe to emit, in enqueue
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn poll_emittable(&self) -> Result<Vec<EmittedCheckpoint>> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        if state.aborted {
            return Ok(Vec::new());
        }

        let mut blocked: HashSet<Lane> = HashSet::new();
        let mut still_pending = VecDeque::with_capacity(state.pending.len());
        let mut emitted = Vec::new();
        for marker in std::mem::take(&mut state.pending) {
            let satisfied = !blocked.contains(&marker.lane)
                && marker.depends_on.iter().all(|id| {
                    state
                        .buckets
                        .get(id)
                        .map_or(true, |bucket| bucket.outstanding == 0)
                });
            if !satisfied {
                blocked.insert(marker.lane.clone());
                still_pending.push_back(marker);
                continue;
            }
            for id in &marker.depends_on {
                state.buckets.remove(id);
            }
            emitted.push(EmittedCheckpoint {
                id: marker.id,
                scope: marker.scope,
                stream: marker.stream,
                state: marker.state,
                record_count: marker.record_count,
            });
        }
        state.pending = still_pending;
        state.emitted += emitted.len() as u64;
        Ok(emitted)
    }

    /// Abandon every pending marker after a fatal failure. Abandoned markers
    /// release their memory and are never emitted; later markers are
    /// rejected. Returns how many markers were abandoned.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn abandon_pending(&self) -> Result<usize> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        state.aborted = true;
        let count = state.pending.len();
        for marker in state.pending.drain(..) {
            state.abandoned.insert(marker.id);
        }
        if count > 0 {
            tracing::warn!(
                abandoned = count,
                "Abandoning pending checkpoints; progress past the last emitted checkpoint is not durable"
            );
        }
        Ok(count)
    }

    /// Number of markers still waiting on unflushed records.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn pending_markers(&self) -> Result<usize> {
        Ok(self.lock_state()?.pending.len())
    }

    /// Total markers emitted so far.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn emitted_markers(&self) -> Result<u64> {
        Ok(self.lock_state()?.emitted)
    }

    /// Status of a marker, or `None` for an id never handed out.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the tracker mutex was poisoned.
    pub fn marker_status(&self, id: MarkerId) -> Result<Option<MarkerStatus>> {
        let state = self.lock_state()?;
        if id >= state.next_marker_id {
            return Ok(None);
        }
        if state.abandoned.contains(&id) {
            return Ok(Some(MarkerStatus::Abandoned));
        }
        if state.pending.iter().any(|m| m.id == id) {
            return Ok(Some(MarkerStatus::Pending));
        }
        Ok(Some(MarkerStatus::Flushed))
    }
}

#[cfg(test)]
impl CheckpointTracker {
    /// Poison the state mutex so callers observe `LockPoisoned`.
    pub(crate) fn poison(&self) {
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = self.state.lock();
                    panic!("poisoning checkpoint tracker");
                })
                .join();
        });
    }
}
