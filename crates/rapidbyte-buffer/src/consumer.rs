//! Start / accept / close lifecycle over the buffer and its flush workers.

use std::sync::Arc;

use rapidbyte_types::checkpoint::CheckpointScope;
use rapidbyte_types::error::ConnectorError;
use rapidbyte_types::message::BufferedItem;
use rapidbyte_types::stream::StreamKey;

use crate::buffer::{new_buffer, BufferDequeue, BufferEnqueue};
use crate::checkpoint::CheckpointTracker;
use crate::config::types::BufferConfig;
use crate::config::validator::validate_buffer_config;
use crate::error::{BufferError, Result};
use crate::failure::FlushFailure;
use crate::flush::workers::{FlushWorkerOptions, FlushWorkers};
use crate::flush::{CheckpointEmitter, CheckpointSink, DestinationFlush};
use crate::memory::MemoryAccountant;
use crate::result::{FlushSummary, SummaryCollector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Closed,
}

/// Buffers records for a destination and flushes them in the background.
///
/// Call [`start`](Self::start) once, feed items through
/// [`accept`](Self::accept), then [`close`](Self::close) to drain. The first
/// flush error fails the run and is returned from the next `accept` or from
/// `close`.
pub struct BufferedConsumer<F: DestinationFlush, S: CheckpointSink> {
    config: BufferConfig,
    flush: Arc<F>,
    enqueue: BufferEnqueue,
    dequeue: BufferDequeue,
    memory: Arc<MemoryAccountant>,
    tracker: Arc<CheckpointTracker>,
    failure: Arc<FlushFailure>,
    emitter: Arc<CheckpointEmitter<S>>,
    summary: Arc<SummaryCollector>,
    workers: Option<FlushWorkers<F, S>>,
    lifecycle: Lifecycle,
}

impl<F: DestinationFlush, S: CheckpointSink> BufferedConsumer<F, S> {
    /// Build a consumer from validated config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` listing every problem with `config`.
    pub fn new(config: BufferConfig, flush: F, sink: S) -> Result<Self> {
        validate_buffer_config(&config).map_err(|e| BufferError::InvalidConfig(e.to_string()))?;
        let budget = config
            .memory_budget_bytes()
            .map_err(|e| BufferError::InvalidConfig(format!("{e:#}")))?;
        let memory = Arc::new(MemoryAccountant::with_pressure_ratio(
            budget,
            config.memory_pressure_ratio,
        )?);
        let tracker = Arc::new(CheckpointTracker::new(config.global_checkpoint_policy));
        let (enqueue, dequeue) = new_buffer(Arc::clone(&memory), Arc::clone(&tracker));
        let failure = Arc::new(FlushFailure::new());
        let summary = Arc::new(SummaryCollector::default());
        let emitter = Arc::new(CheckpointEmitter::new(
            Arc::clone(&tracker),
            Arc::clone(&failure),
            Arc::new(sink),
            Arc::clone(&summary),
        ));

        Ok(Self {
            config,
            flush: Arc::new(flush),
            enqueue,
            dequeue,
            memory,
            tracker,
            failure,
            emitter,
            summary,
            workers: None,
            lifecycle: Lifecycle::Created,
        })
    }

    /// Spawn the flush workers on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call and `Closed` after `close`.
    pub fn start(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started => return Err(BufferError::AlreadyStarted),
            Lifecycle::Closed => return Err(BufferError::Closed),
        }
        self.spawn_workers();
        self.lifecycle = Lifecycle::Started;
        Ok(())
    }

    fn spawn_workers(&mut self) {
        tracing::info!(
            memory_budget_bytes = self.memory.capacity_bytes(),
            workers = self.config.worker_pool_size,
            "Starting buffered consumer"
        );
        self.workers = Some(FlushWorkers::start(
            FlushWorkerOptions {
                pool_size: self.config.worker_pool_size,
                idle_poll_interval: self.config.worker_idle_poll_interval(),
                max_time_between_flushes: self.config.max_time_between_flushes(),
            },
            Arc::clone(&self.flush),
            self.dequeue.clone(),
            Arc::clone(&self.emitter),
            Arc::clone(&self.failure),
            Arc::clone(&self.summary),
        ));
    }

    /// Buffer one item. Waits while the memory budget is exhausted.
    ///
    /// Keys without a namespace get the configured default namespace, as do
    /// the streams listed by a global marker.
    ///
    /// # Errors
    ///
    /// Returns the recorded `Flush` error once the run has failed, `Closed`
    /// after `close`, `ItemTooLarge` for an item that can never fit, or
    /// `MixedCheckpointScopes` for a marker whose scope differs from earlier
    /// markers.
    pub async fn accept(&self, stream: StreamKey, item: BufferedItem) -> Result<()> {
        if self.lifecycle == Lifecycle::Closed {
            return Err(BufferError::Closed);
        }
        if let Some(err) = self.failure.error() {
            return Err(BufferError::Flush(err));
        }

        let default_ns = self.config.default_namespace.as_deref();
        let stream = stream.with_default_namespace(default_ns);
        let item = match item {
            BufferedItem::Marker(mut marker) => {
                if let CheckpointScope::Global { streams } = &mut marker.scope {
                    for key in streams.iter_mut() {
                        *key = key.clone().with_default_namespace(default_ns);
                    }
                }
                BufferedItem::Marker(marker)
            }
            record @ BufferedItem::Record(_) => record,
        };
        let is_marker = matches!(item, BufferedItem::Marker(_));

        match self.enqueue.enqueue(stream, item).await {
            Ok(()) => {}
            Err(BufferError::Closed) => {
                return Err(self
                    .failure
                    .error()
                    .map_or(BufferError::Closed, BufferError::Flush));
            }
            Err(err) => return Err(err),
        }

        if is_marker {
            self.emitter.emit_ready()?;
        }
        Ok(())
    }

    /// Stop ingestion and drain.
    ///
    /// On success every queue is empty and every checkpoint has been emitted.
    ///
    /// # Errors
    ///
    /// Returns the recorded `Flush` error if the run failed (pending
    /// checkpoints are abandoned), `ShutdownTimeout` if draining exceeded
    /// `shutdown_drain_timeout_secs`, `Infrastructure` if a worker panicked,
    /// or `Closed` if already closed.
    pub async fn close(&mut self) -> Result<FlushSummary> {
        match self.lifecycle {
            Lifecycle::Closed => return Err(BufferError::Closed),
            Lifecycle::Created => self.spawn_workers(),
            Lifecycle::Started => {}
        }
        self.lifecycle = Lifecycle::Closed;

        if let Some(err) = self.failure.error() {
            return Err(self.fail_close(err).await);
        }

        let timeout = self.config.shutdown_drain_timeout();
        if let Some(workers) = self.workers.as_mut() {
            match tokio::time::timeout(timeout, workers.drain()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.abandon_pending();
                    return Err(err);
                }
                Err(_) => {
                    tracing::error!(
                        timeout_secs = timeout.as_secs(),
                        queued_bytes = self.dequeue.total_queued_bytes().unwrap_or(0),
                        "Buffer drain timed out, aborting flush workers"
                    );
                    workers.abort().await;
                    self.abandon_pending();
                    return Err(BufferError::ShutdownTimeout { timeout });
                }
            }
        }

        if let Some(err) = self.failure.error() {
            return Err(self.fail_close(err).await);
        }

        self.emitter.emit_ready()?;
        let pending = self.tracker.pending_markers()?;
        if pending > 0 {
            tracing::warn!(pending, "Checkpoints still pending after drain");
        }

        let summary = self.summary.snapshot();
        tracing::info!(
            records = summary.records_flushed,
            bytes = summary.bytes_flushed,
            batches = summary.batches_flushed,
            checkpoints = summary.checkpoints_emitted,
            "Buffered consumer closed"
        );
        Ok(summary)
    }

    async fn fail_close(&mut self, err: ConnectorError) -> BufferError {
        tracing::error!(error = %err, "Closing buffered consumer after flush failure");
        if let Some(workers) = self.workers.as_mut() {
            workers.abort().await;
        }
        self.memory.close();
        self.abandon_pending();
        BufferError::Flush(err)
    }

    fn abandon_pending(&self) {
        if let Err(e) = self.tracker.abandon_pending() {
            tracing::error!(error = %e, "Failed to abandon pending checkpoints");
        }
    }

    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    #[must_use]
    pub fn dequeue(&self) -> &BufferDequeue {
        &self.dequeue
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryAccountant {
        &self.memory
    }

    #[must_use]
    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    #[must_use]
    pub fn failure(&self) -> &FlushFailure {
        &self.failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapidbyte_types::checkpoint::EmittedCheckpoint;
    use rapidbyte_types::message::{MarkerItem, RecordItem};
    use tokio::sync::mpsc;

    struct NoopFlush;

    impl DestinationFlush for NoopFlush {
        fn optimal_batch_size_bytes(&self) -> u64 {
            1024
        }

        async fn flush(
            &self,
            _stream: &StreamKey,
            _records: &[RecordItem],
        ) -> std::result::Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn consumer(
        config: BufferConfig,
    ) -> (
        BufferedConsumer<NoopFlush, mpsc::UnboundedSender<EmittedCheckpoint>>,
        mpsc::UnboundedReceiver<EmittedCheckpoint>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BufferedConsumer::new(config, NoopFlush, tx).unwrap(), rx)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel::<EmittedCheckpoint>();
        let config = BufferConfig {
            worker_pool_size: 0,
            ..BufferConfig::default()
        };
        let err = BufferedConsumer::new(config, NoopFlush, tx).err().unwrap();
        assert!(matches!(err, BufferError::InvalidConfig(ref msg) if msg.contains("worker_pool_size")));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (mut consumer, _rx) = consumer(BufferConfig::default());
        consumer.start().unwrap();
        assert!(matches!(consumer.start(), Err(BufferError::AlreadyStarted)));
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn accept_after_close_fails() {
        let (mut consumer, _rx) = consumer(BufferConfig::default());
        consumer.start().unwrap();
        consumer.close().await.unwrap();
        let err = consumer
            .accept(StreamKey::unqualified("users"), RecordItem::new("x").into())
            .await
            .unwrap_err();
        assert!(matches!(err, BufferError::Closed));
        assert!(matches!(consumer.close().await, Err(BufferError::Closed)));
    }

    #[tokio::test]
    async fn default_namespace_applies_to_records_and_global_markers() {
        let config = BufferConfig {
            default_namespace: Some("analytics".to_string()),
            global_checkpoint_policy: crate::checkpoint::GlobalCheckpointPolicy::ListedStreams,
            ..BufferConfig::default()
        };
        let (consumer, _rx) = consumer(config);
        consumer
            .accept(StreamKey::unqualified("users"), RecordItem::new("x").into())
            .await
            .unwrap();
        let qualified = StreamKey::new("analytics", "users");
        assert_eq!(consumer.dequeue().queue_size_records(&qualified).unwrap(), Some(1));

        let marker = MarkerItem::new(
            CheckpointScope::Global {
                streams: vec![StreamKey::unqualified("users")],
            },
            serde_json::json!({"lsn": 7}),
        );
        consumer
            .accept(StreamKey::unqualified("users"), marker.into())
            .await
            .unwrap();
        assert_eq!(consumer.tracker().pending_markers().unwrap(), 1);
    }

    #[tokio::test]
    async fn close_without_start_still_drains() {
        let (mut consumer, mut rx) = consumer(BufferConfig::default());
        let users = StreamKey::new("public", "users");
        consumer
            .accept(users.clone(), RecordItem::new("x").into())
            .await
            .unwrap();
        consumer
            .accept(users, MarkerItem::stream(serde_json::json!(1)).into())
            .await
            .unwrap();

        let summary = consumer.close().await.unwrap();
        assert_eq!(summary.records_flushed, 1);
        assert_eq!(summary.checkpoints_emitted, 1);
        assert_eq!(rx.recv().await.unwrap().record_count, 1);
        assert_eq!(consumer.memory().used_bytes(), 0);
    }
}
