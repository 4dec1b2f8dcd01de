//! Pool of flush workers draining the buffer into a [`DestinationFlush`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;

use rapidbyte_types::error::ConnectorError;

use super::detect::DetectStreamToFlush;
use super::running::{RunningFlushWorkers, StreamClaim};
use super::{CheckpointEmitter, CheckpointSink, DestinationFlush};
use crate::buffer::BufferDequeue;
use crate::error::{BufferError, Result};
use crate::failure::FlushFailure;
use crate::result::SummaryCollector;

const STATE_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of the pool. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Flush eligible streams, idle otherwise.
    Running,
    /// Flush every queue regardless of size, then exit.
    Draining,
    /// Start no new flushes.
    Aborted,
}

/// Pool sizing and timing.
#[derive(Debug, Clone, Copy)]
pub struct FlushWorkerOptions {
    pub pool_size: usize,
    pub idle_poll_interval: Duration,
    pub max_time_between_flushes: Duration,
}

struct WorkerContext<F, S> {
    flush: Arc<F>,
    dequeue: BufferDequeue,
    detect: DetectStreamToFlush,
    running: Arc<RunningFlushWorkers>,
    emitter: Arc<CheckpointEmitter<S>>,
    failure: Arc<FlushFailure>,
    summary: Arc<SummaryCollector>,
    phase: watch::Sender<WorkerPhase>,
    batch_size_bytes: u64,
    idle_poll_interval: Duration,
}

impl<F: DestinationFlush, S: CheckpointSink> WorkerContext<F, S> {
    async fn run(
        self: Arc<Self>,
        worker_id: usize,
        mut phase_rx: watch::Receiver<WorkerPhase>,
    ) {
        tracing::debug!(worker_id, "Flush worker started");
        loop {
            let phase = *phase_rx.borrow_and_update();
            if phase == WorkerPhase::Aborted || self.failure.is_failed() {
                break;
            }
            let draining = phase == WorkerPhase::Draining;

            match self.detect.claim_next(draining) {
                Ok(Some(claim)) => {
                    if let Err(err) = self.flush_claimed(worker_id, claim).await {
                        self.fail_internal(worker_id, &err);
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    self.fail_internal(worker_id, &err);
                    break;
                }
            }

            if let Err(err) = self.emitter.emit_ready() {
                self.fail_internal(worker_id, &err);
                break;
            }
            if draining {
                match self.dequeue.buffered_streams() {
                    Ok(streams) if streams.is_empty() => break,
                    Ok(_) => {}
                    Err(err) => {
                        self.fail_internal(worker_id, &err);
                        break;
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.idle_poll_interval) => {}
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker_id, "Flush worker exiting");
    }

    async fn flush_claimed(&self, worker_id: usize, claim: StreamClaim) -> Result<()> {
        let stream = claim.stream().clone();
        let Some(batch) = self.dequeue.take(&stream, self.batch_size_bytes)? else {
            return Ok(());
        };
        let batch_id = batch.id();
        if self.failure.is_failed() || *self.phase.borrow() == WorkerPhase::Aborted {
            tracing::debug!(
                worker_id,
                stream = %stream,
                batch_id,
                "Dropping batch, flushing has stopped"
            );
            self.dequeue.tracker().discard_batch(batch_id)?;
            return Ok(());
        }
        let records = batch.len() as u64;
        let bytes = batch.size_bytes();
        tracing::debug!(
            worker_id,
            stream = %stream,
            batch_id,
            records,
            bytes,
            "Flushing batch"
        );

        let started = Instant::now();
        let outcome = self.flush.flush(&stream, batch.records()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                self.dequeue.tracker().record_batch_flushed(batch_id)?;
                self.summary.record_batch(&stream, records, bytes, elapsed);
                batch.close();
                drop(claim);
                tracing::debug!(
                    worker_id,
                    stream = %stream,
                    batch_id,
                    flush_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Batch flushed"
                );
                self.emitter.emit_ready()?;
            }
            Err(err) => {
                tracing::error!(
                    worker_id,
                    stream = %stream,
                    batch_id,
                    records,
                    error = %err,
                    "Flush failed"
                );
                self.fail(err);
                self.dequeue.tracker().discard_batch(batch_id)?;
                drop(batch);
                drop(claim);
            }
        }
        Ok(())
    }

    /// Record `err` as the run's failure and stop the pipeline if it is the
    /// first one.
    fn fail(&self, err: ConnectorError) {
        if !self.failure.record_failure(err) {
            return;
        }
        self.phase.send_replace(WorkerPhase::Aborted);
        self.dequeue.memory().close();
        if let Err(e) = self.dequeue.tracker().abandon_pending() {
            tracing::error!(error = %e, "Failed to abandon pending checkpoints");
        }
    }

    fn fail_internal(&self, worker_id: usize, err: &BufferError) {
        tracing::error!(worker_id, error = %err, "Flush worker hit an internal error");
        self.fail(ConnectorError::internal("BUFFER_INTERNAL", err.to_string()));
    }

    async fn log_state(self: Arc<Self>, mut phase_rx: watch::Receiver<WorkerPhase>) {
        let mut ticker = tokio::time::interval(STATE_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            if *phase_rx.borrow_and_update() != WorkerPhase::Running {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.log_buffer_state(),
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn log_buffer_state(&self) {
        let memory = self.dequeue.memory();
        tracing::debug!(
            queued_bytes = self.dequeue.total_queued_bytes().unwrap_or(0),
            queued_records = self.dequeue.total_queued_records().unwrap_or(0),
            memory_used_bytes = memory.used_bytes(),
            memory_capacity_bytes = memory.capacity_bytes(),
            blocked_reservers = memory.waiting(),
            in_flight_streams = self.running.in_flight().map(|s| s.len()).unwrap_or(0),
            pending_checkpoints = self.dequeue.tracker().pending_markers().unwrap_or(0),
            "Buffer state"
        );
    }
}

/// Owns the worker tasks. Dropping the pool aborts them.
pub struct FlushWorkers<F, S> {
    ctx: Arc<WorkerContext<F, S>>,
    tasks: JoinSet<()>,
}

impl<F: DestinationFlush, S: CheckpointSink> FlushWorkers<F, S> {
    /// Spawn `options.pool_size` workers plus a state logger on the current
    /// runtime.
    pub(crate) fn start(
        options: FlushWorkerOptions,
        flush: Arc<F>,
        dequeue: BufferDequeue,
        emitter: Arc<CheckpointEmitter<S>>,
        failure: Arc<FlushFailure>,
        summary: Arc<SummaryCollector>,
    ) -> Self {
        let running = Arc::new(RunningFlushWorkers::default());
        let detect = DetectStreamToFlush::new(
            dequeue.clone(),
            Arc::clone(&running),
            flush.queue_flush_threshold_bytes(),
            options.max_time_between_flushes,
        );
        let batch_size_bytes = flush.optimal_batch_size_bytes();
        let (phase, _) = watch::channel(WorkerPhase::Running);
        let ctx = Arc::new(WorkerContext {
            flush,
            dequeue,
            detect,
            running,
            emitter,
            failure,
            summary,
            phase,
            batch_size_bytes,
            idle_poll_interval: options.idle_poll_interval,
        });

        // Receivers exist before any task is polled, so an early phase change
        // is never missed.
        let mut tasks = JoinSet::new();
        for worker_id in 0..options.pool_size {
            let phase_rx = ctx.phase.subscribe();
            tasks.spawn(Arc::clone(&ctx).run(worker_id, phase_rx));
        }
        tasks.spawn(Arc::clone(&ctx).log_state(ctx.phase.subscribe()));
        tracing::info!(
            workers = options.pool_size,
            batch_size_bytes,
            "Flush workers started"
        );
        Self { ctx, tasks }
    }

    #[must_use]
    pub fn phase(&self) -> WorkerPhase {
        *self.ctx.phase.borrow()
    }

    /// Streams with a flush currently in flight.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if the claim mutex was poisoned.
    pub fn in_flight_streams(&self) -> Result<Vec<rapidbyte_types::stream::StreamKey>> {
        Ok(self.ctx.running.in_flight()?.into_iter().collect())
    }

    /// Flush every buffered record, then wait for all workers to exit.
    ///
    /// # Errors
    ///
    /// Returns `Infrastructure` if a worker task panicked.
    pub async fn drain(&mut self) -> Result<()> {
        self.ctx.phase.send_if_modified(|phase| {
            if *phase == WorkerPhase::Running {
                *phase = WorkerPhase::Draining;
                true
            } else {
                false
            }
        });
        tracing::info!("Draining flush workers");
        self.join_all().await
    }

    /// Stop starting flushes, cancel in-flight ones, and wait for the tasks.
    pub async fn abort(&mut self) {
        self.ctx.phase.send_replace(WorkerPhase::Aborted);
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(join_err) = joined {
                if join_err.is_panic() {
                    tracing::error!("Flush worker panicked: {join_err}");
                }
            }
        }
    }

    async fn join_all(&mut self) -> Result<()> {
        let mut first_error: Option<BufferError> = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(()) => {}
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    tracing::error!("Flush worker panicked: {join_err}");
                    if first_error.is_none() {
                        first_error = Some(BufferError::Infrastructure(anyhow::anyhow!(
                            "Flush worker panicked: {join_err}"
                        )));
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
