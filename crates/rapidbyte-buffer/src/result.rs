//! Flush run summary types.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use rapidbyte_types::stream::StreamKey;

/// Aggregate counts for one consumer run, returned by a clean `close`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    pub records_flushed: u64,
    pub bytes_flushed: u64,
    pub batches_flushed: u64,
    pub checkpoints_emitted: u64,
    pub flush_duration_secs: f64,
    pub stream_metrics: Vec<StreamFlushMetric>,
}

/// Per-stream flush counts.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFlushMetric {
    pub stream: StreamKey,
    pub records_flushed: u64,
    pub bytes_flushed: u64,
    pub batches_flushed: u64,
    pub flush_duration_secs: f64,
}

#[derive(Debug, Default)]
struct Counts {
    checkpoints_emitted: u64,
    streams: BTreeMap<StreamKey, StreamFlushMetric>,
}

/// Shared accumulator the workers write into.
#[derive(Debug, Default)]
pub(crate) struct SummaryCollector {
    counts: Mutex<Counts>,
}

impl SummaryCollector {
    pub(crate) fn record_batch(
        &self,
        stream: &StreamKey,
        records: u64,
        bytes: u64,
        elapsed: Duration,
    ) {
        let Ok(mut counts) = self.counts.lock() else {
            return;
        };
        let metric = counts
            .streams
            .entry(stream.clone())
            .or_insert_with(|| StreamFlushMetric {
                stream: stream.clone(),
                records_flushed: 0,
                bytes_flushed: 0,
                batches_flushed: 0,
                flush_duration_secs: 0.0,
            });
        metric.records_flushed += records;
        metric.bytes_flushed += bytes;
        metric.batches_flushed += 1;
        metric.flush_duration_secs += elapsed.as_secs_f64();
    }

    pub(crate) fn record_checkpoint(&self) {
        if let Ok(mut counts) = self.counts.lock() {
            counts.checkpoints_emitted += 1;
        }
    }

    pub(crate) fn snapshot(&self) -> FlushSummary {
        let Ok(counts) = self.counts.lock() else {
            return FlushSummary::default();
        };
        let stream_metrics: Vec<StreamFlushMetric> = counts.streams.values().cloned().collect();
        FlushSummary {
            records_flushed: stream_metrics.iter().map(|m| m.records_flushed).sum(),
            bytes_flushed: stream_metrics.iter().map(|m| m.bytes_flushed).sum(),
            batches_flushed: stream_metrics.iter().map(|m| m.batches_flushed).sum(),
            checkpoints_emitted: counts.checkpoints_emitted,
            flush_duration_secs: stream_metrics.iter().map(|m| m.flush_duration_secs).sum(),
            stream_metrics,
        }
    }
}
