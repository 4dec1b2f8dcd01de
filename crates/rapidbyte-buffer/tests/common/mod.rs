//! Shared doubles for buffer integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use rapidbyte_buffer::{BufferConfig, CheckpointSink, DestinationFlush};
use rapidbyte_types::checkpoint::EmittedCheckpoint;
use rapidbyte_types::error::ConnectorError;
use rapidbyte_types::message::RecordItem;
use rapidbyte_types::stream::StreamKey;

/// Install a test-writer subscriber once. `RUST_LOG` controls the level.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

pub fn config(memory_budget: &str, workers: usize) -> BufferConfig {
    BufferConfig {
        memory_budget: memory_budget.to_string(),
        worker_pool_size: workers,
        worker_idle_poll_interval_ms: 2,
        shutdown_drain_timeout_secs: 10,
        ..BufferConfig::default()
    }
}

#[derive(Debug, Clone)]
pub struct FlushCall {
    pub stream: StreamKey,
    pub payloads: Vec<Bytes>,
}

/// Flush double that logs every successful call. It can fail a chosen call
/// and can hold each call until the test hands out a permit.
#[derive(Clone)]
pub struct ScriptedFlush {
    optimal: u64,
    fail_on_call: Option<usize>,
    gate: Option<Arc<Semaphore>>,
    pub calls: Arc<AtomicUsize>,
    pub log: Arc<Mutex<Vec<FlushCall>>>,
}

impl ScriptedFlush {
    pub fn new(optimal_batch_size_bytes: u64) -> Self {
        Self {
            optimal: optimal_batch_size_bytes,
            fail_on_call: None,
            gate: None,
            calls: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<FlushCall> {
        self.log.lock().unwrap().clone()
    }

    /// Payloads flushed for `stream`, in flush order.
    pub fn flushed_payloads(&self, stream: &StreamKey) -> Vec<Bytes> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| &c.stream == stream)
            .flat_map(|c| c.payloads.iter().cloned())
            .collect()
    }

    pub fn flushed_counts(&self) -> HashMap<StreamKey, usize> {
        let mut counts = HashMap::new();
        for call in self.log.lock().unwrap().iter() {
            *counts.entry(call.stream.clone()).or_default() += call.payloads.len();
        }
        counts
    }
}

impl DestinationFlush for ScriptedFlush {
    fn optimal_batch_size_bytes(&self) -> u64 {
        self.optimal
    }

    async fn flush(&self, stream: &StreamKey, records: &[RecordItem]) -> Result<(), ConnectorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ConnectorError::internal("GATE_CLOSED", "test gate closed"))?
                .forget();
        }
        if self.fail_on_call == Some(call) {
            return Err(ConnectorError::transient_db(
                "WRITE_FAILED",
                format!("flush call {call} failed"),
            ));
        }
        self.log.lock().unwrap().push(FlushCall {
            stream: stream.clone(),
            payloads: records.iter().map(|r| r.payload.clone()).collect(),
        });
        Ok(())
    }
}

/// Checkpoint sink that records, for every checkpoint, how many records of
/// each stream had been flushed at the moment it was emitted.
#[derive(Clone)]
pub struct RecordingSink {
    flush: ScriptedFlush,
    pub emitted: Arc<Mutex<Vec<(EmittedCheckpoint, HashMap<StreamKey, usize>)>>>,
}

impl RecordingSink {
    pub fn new(flush: &ScriptedFlush) -> Self {
        Self {
            flush: flush.clone(),
            emitted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn checkpoints(&self) -> Vec<EmittedCheckpoint> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }
}

impl CheckpointSink for RecordingSink {
    fn emit(&self, checkpoint: EmittedCheckpoint) {
        let flushed = self.flush.flushed_counts();
        self.emitted.lock().unwrap().push((checkpoint, flushed));
    }
}

pub fn record(payload: impl Into<String>, size: u64) -> RecordItem {
    RecordItem::new(payload.into()).with_size(size)
}
