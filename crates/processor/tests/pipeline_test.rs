//! End-to-end runs: collector -> log -> aggregator -> sink

mod common;

use collector::{Collector, CollectorConfig, MemoryDeadLetterQueue, SubmitOutcome};
use common::{eventually, test_config, window_start};
use eventlog::InMemoryLog;
use llm_telemetry_types::DimensionKey;
use processor::{
    AggregationStateStore, AggregatorConfig, JsonLinesSink, MemorySink, SledConfig,
    SledStateStore, WindowAggregator,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn raw_event(id: &str, model: &str, time: &str, latency_ms: f64) -> Value {
    json!({
        "event_id": id,
        "event_time": time,
        "dimension": {"model": model, "model_version": "v1"},
        "metrics": {"latency_ms": latency_ms, "tokens_in": 12, "tokens_out": 30}
    })
}

fn collector(log: Arc<InMemoryLog>) -> Arc<Collector> {
    let config = CollectorConfig {
        queue_capacity: 64,
        publisher_workers: 1,
        ..CollectorConfig::default()
    };
    let collector =
        Collector::new(config, log, Arc::new(MemoryDeadLetterQueue::new())).unwrap();
    collector.start().unwrap();
    Arc::new(collector)
}

async fn submit_all(collector: &Collector, events: Vec<Value>) {
    for raw in events {
        let outcome = collector.submit(raw).await;
        assert!(matches!(outcome, SubmitOutcome::Accepted { .. }), "{outcome:?}");
    }
}

#[tokio::test]
async fn test_three_latencies_produce_one_row() {
    let log = Arc::new(InMemoryLog::new(1));
    let collector = collector(log.clone());
    let sink = Arc::new(MemorySink::new());
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SledStateStore::open(SledConfig::new(dir.path().join("state")))
            .await
            .unwrap(),
    );

    let aggregator = Arc::new(
        WindowAggregator::new(test_config(), log.clone(), store.clone(), sink.clone()).unwrap(),
    );
    let running = tokio::spawn(Arc::clone(&aggregator).run());

    submit_all(
        &collector,
        vec![
            raw_event("r-1", "modelA", "2024-05-01T12:00:05Z", 100.0),
            raw_event("r-2", "modelA", "2024-05-01T12:00:10Z", 200.0),
            raw_event("r-3", "modelA", "2024-05-01T12:00:15Z", 300.0),
            // moves the watermark past 12:01:00
            raw_event("r-4", "modelB", "2024-05-01T12:02:00Z", 50.0),
        ],
    )
    .await;

    let key = DimensionKey::new("modelA", "v1");
    let start = window_start().timestamp_millis();
    let (sink_ref, key_ref) = (&sink, &key);
    let emitted = eventually(
        || async move { sink_ref.get(start, key_ref).is_some() },
        Duration::from_secs(5),
    )
    .await;
    assert!(emitted, "window was not emitted");

    let row = sink.get(start, &key).unwrap();
    assert_eq!(row.count, 3);
    assert_eq!(row.error_count, 0);
    assert_eq!(row.error_rate, 0.0);
    assert_eq!(row.min_latency_ms, 100.0);
    assert_eq!(row.max_latency_ms, 300.0);
    assert_eq!(row.avg_latency_ms, 200.0);
    assert!((row.p50_latency_ms - 200.0).abs() <= 2.0, "p50 = {}", row.p50_latency_ms);
    assert_eq!(row.sum_tokens_in, 36);
    assert_eq!(sink.len(), 1);

    aggregator.shutdown();
    running.await.unwrap().unwrap();
    collector.shutdown().await.unwrap();

    let offsets = store.load_offsets().await.unwrap();
    assert_eq!(offsets[&0].offset, 3);
}

#[tokio::test]
async fn test_restart_resumes_after_committed_offset() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state");
    let sink_path = dir.path().join("aggregates.jsonl");
    let log = Arc::new(InMemoryLog::new(1));
    let collector = collector(log.clone());

    submit_all(
        &collector,
        vec![
            raw_event("a-1", "modelA", "2024-05-01T12:00:01Z", 10.0),
            raw_event("a-2", "modelA", "2024-05-01T12:00:02Z", 20.0),
        ],
    )
    .await;

    {
        let store = Arc::new(SledStateStore::open(SledConfig::new(&state_path)).await.unwrap());
        let sink = Arc::new(JsonLinesSink::open(&sink_path).unwrap());
        let aggregator =
            Arc::new(WindowAggregator::new(test_config(), log.clone(), store.clone(), sink).unwrap());
        let running = tokio::spawn(Arc::clone(&aggregator).run());

        let store_ref = &store;
        let committed = eventually(
            || async move {
                store_ref
                    .load_offsets()
                    .await
                    .map(|offsets| offsets.get(&0).map(|c| c.offset) == Some(1))
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(committed);

        aggregator.shutdown();
        running.await.unwrap().unwrap();
    }

    // more traffic while the aggregator is down, including a redelivered id
    submit_all(
        &collector,
        vec![
            raw_event("a-2", "modelA", "2024-05-01T12:00:02Z", 20.0),
            raw_event("a-3", "modelA", "2024-05-01T12:00:03Z", 30.0),
            raw_event("b-1", "modelB", "2024-05-01T12:05:00Z", 5.0),
        ],
    )
    .await;

    let store = Arc::new(SledStateStore::open(SledConfig::new(&state_path)).await.unwrap());
    let sink = Arc::new(JsonLinesSink::open(&sink_path).unwrap());
    let aggregator = Arc::new(
        WindowAggregator::new(test_config(), log.clone(), store.clone(), sink.clone()).unwrap(),
    );
    let running = tokio::spawn(Arc::clone(&aggregator).run());

    let aggregator_ref = &aggregator;
    let emitted = eventually(
        || async move { aggregator_ref.stats().windows_emitted == 1 },
        Duration::from_secs(5),
    )
    .await;
    assert!(emitted);
    aggregator.shutdown();
    running.await.unwrap().unwrap();
    collector.shutdown().await.unwrap();

    let rows = JsonLinesSink::read_rows(&sink_path).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].count, 3);
    assert_eq!(aggregator.stats().duplicates_skipped, 1);
}

#[tokio::test]
async fn test_idle_partition_closes_window() {
    let log = Arc::new(InMemoryLog::new(1));
    let collector = collector(log.clone());
    let sink = Arc::new(MemorySink::new());
    let config = AggregatorConfig {
        window_size: Duration::from_secs(1),
        allowed_lateness: Duration::ZERO,
        idle_timeout: Some(Duration::from_millis(50)),
        ..test_config()
    };
    let aggregator = Arc::new(
        WindowAggregator::new(
            config,
            log.clone(),
            Arc::new(processor::MemoryStateStore::new()),
            sink.clone(),
        )
        .unwrap(),
    );
    let running = tokio::spawn(Arc::clone(&aggregator).run());

    // nothing follows this event, so only idle advancement can close its window
    submit_all(
        &collector,
        vec![raw_event("lonely", "modelA", "2024-05-01T12:00:00.900Z", 42.0)],
    )
    .await;

    let key = DimensionKey::new("modelA", "v1");
    let start = window_start().timestamp_millis();
    let (sink_ref, key_ref) = (&sink, &key);
    let emitted = eventually(
        || async move { sink_ref.get(start, key_ref).is_some() },
        Duration::from_secs(5),
    )
    .await;
    assert!(emitted, "idle partition never closed its window");
    assert_eq!(sink.get(start, &key).unwrap().count, 1);

    aggregator.shutdown();
    running.await.unwrap().unwrap();
    collector.shutdown().await.unwrap();
}
