mod common;

use std::collections::HashMap;

use proptest::prelude::*;

use rapidbyte_buffer::BufferedConsumer;
use rapidbyte_types::message::{BufferedItem, MarkerItem};
use rapidbyte_types::stream::StreamKey;

use common::{config, record, RecordingSink, ScriptedFlush};

#[derive(Debug, Clone)]
enum Step {
    Record { stream: usize, size: u64 },
    Marker { stream: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0_usize..3, 1_u64..64).prop_map(|(stream, size)| Step::Record { stream, size }),
        1 => (0_usize..3).prop_map(|stream| Step::Marker { stream }),
    ]
}

fn stream_key(idx: usize) -> StreamKey {
    StreamKey::new("public", format!("s{idx}"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn flushed_records_match_enqueued_order_and_checkpoints_never_run_ahead(
        steps in prop::collection::vec(step(), 1..120),
        optimal in 1_u64..256,
        workers in 1_usize..4,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let flush = ScriptedFlush::new(optimal);
        let sink = RecordingSink::new(&flush);

        let mut expected: HashMap<StreamKey, Vec<String>> = HashMap::new();
        // step -> (stream, records before the marker, records since the previous marker)
        let mut markers: HashMap<u64, (StreamKey, usize, u64)> = HashMap::new();
        let mut since_last_marker: HashMap<StreamKey, u64> = HashMap::new();

        runtime.block_on(async {
            let mut consumer =
                BufferedConsumer::new(config("1kb", workers), flush.clone(), sink.clone()).unwrap();
            consumer.start().unwrap();

            for (i, step) in steps.iter().enumerate() {
                let (key, item): (StreamKey, BufferedItem) = match step {
                    Step::Record { stream, size } => {
                        let key = stream_key(*stream);
                        let payload = format!("{i}");
                        expected.entry(key.clone()).or_default().push(payload.clone());
                        *since_last_marker.entry(key.clone()).or_default() += 1;
                        (key, record(payload, *size).into())
                    }
                    Step::Marker { stream } => {
                        let key = stream_key(*stream);
                        let covered = expected.get(&key).map_or(0, Vec::len);
                        let count = since_last_marker.remove(&key).unwrap_or(0);
                        markers.insert(i as u64, (key.clone(), covered, count));
                        (key, MarkerItem::stream(serde_json::json!({ "step": i })).into())
                    }
                };
                consumer.accept(key, item).await.unwrap();
                if i % 7 == 0 {
                    tokio::task::yield_now().await;
                }
            }

            consumer.close().await.unwrap();
            for idx in 0..3 {
                let key = stream_key(idx);
                assert_eq!(consumer.dequeue().queue_size_bytes(&key).unwrap(), None);
            }
            assert_eq!(consumer.memory().used_bytes(), 0);
        });

        for (key, payloads) in &expected {
            let flushed: Vec<String> = flush
                .flushed_payloads(key)
                .iter()
                .map(|b| String::from_utf8(b.to_vec()).unwrap())
                .collect();
            prop_assert_eq!(&flushed, payloads);
        }

        let emitted = sink.emitted.lock().unwrap().clone();
        prop_assert_eq!(emitted.len(), markers.len());
        let mut last_step: HashMap<StreamKey, u64> = HashMap::new();
        for (checkpoint, flushed_at_emit) in &emitted {
            let step = checkpoint.state["step"].as_u64().unwrap();
            let (key, covered, count) = &markers[&step];
            prop_assert_eq!(checkpoint.stream.as_ref(), Some(key));
            prop_assert_eq!(checkpoint.record_count, *count);
            if let Some(prev) = last_step.insert(key.clone(), step) {
                prop_assert!(prev < step, "checkpoints of {} emitted out of order", key);
            }
            let flushed = flushed_at_emit.get(key).copied().unwrap_or(0);
            prop_assert!(
                flushed >= *covered,
                "checkpoint for {} emitted after {} of {} covered records",
                key,
                flushed,
                covered
            );
        }
    }
}
