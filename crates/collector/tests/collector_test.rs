//! Integration tests for publishing, retries and rejection routing

mod common;

use collector::{
    Collector, CollectorConfig, DeadLetterSink, FileDeadLetterQueue, DLQConfig, SubmitOutcome,
};
use common::{collector_with, fast_retry, test_config, valid_event, FlakyLog};
use eventlog::{InMemoryLog, LogClient};
use futures::StreamExt;
use llm_telemetry_types::{Event, EventField, RejectionReason};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let log = Arc::new(FlakyLog::new(2));
    let (collector, _) = collector_with(test_config(16), log.clone());
    collector.start().unwrap();

    let outcome = collector.submit(valid_event("retry-me", "modelA")).await;
    assert!(matches!(outcome, SubmitOutcome::Accepted { .. }), "{outcome:?}");
    assert_eq!(log.attempts.load(Ordering::SeqCst), 3);

    let stats = collector.stats();
    assert_eq!(stats.publish_retries, 2);
    assert_eq!(stats.published, 1);
    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_report_unavailable() {
    let log = Arc::new(FlakyLog::new(100));
    let config = CollectorConfig {
        retry: fast_retry(5),
        ..test_config(16)
    };
    let (collector, _) = collector_with(config, log.clone());
    collector.start().unwrap();

    let outcome = collector.submit(valid_event("doomed", "modelA")).await;
    assert_eq!(outcome, SubmitOutcome::Unavailable { attempts: 5 });
    assert_eq!(log.attempts.load(Ordering::SeqCst), 5);
    assert_eq!(log.published(), 0);

    let stats = collector.stats();
    assert_eq!(stats.publish_failures, 1);
    assert_eq!(stats.unavailable, 1);
    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_same_key_lands_on_same_partition() {
    let log = Arc::new(InMemoryLog::new(8));
    let (collector, _) = collector_with(test_config(64), log.clone());
    collector.start().unwrap();

    let mut partitions = Vec::new();
    for i in 0..10 {
        match collector.submit(valid_event(&format!("k-{i}"), "modelA")).await {
            SubmitOutcome::Accepted { partition, .. } => partitions.push(partition),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert!(partitions.windows(2).all(|w| w[0] == w[1]));

    // the published payload decodes back into the typed event
    let mut stream = log.consume(partitions[0], 0).await.unwrap();
    let record = stream.next().await.unwrap().unwrap();
    let event: Event = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(event.event_id(), "k-0");

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejections_go_to_file_dead_letter_queue() {
    let dir = tempfile::tempdir().unwrap();
    let dlq = Arc::new(
        FileDeadLetterQueue::new(DLQConfig {
            file_path: dir.path().to_path_buf(),
            ..DLQConfig::default()
        })
        .unwrap(),
    );
    let log = Arc::new(InMemoryLog::new(2));
    let collector = Collector::new(test_config(8), log.clone(), dlq.clone()).unwrap();
    collector.start().unwrap();

    let mut missing_id = valid_event("x", "modelA");
    missing_id.as_object_mut().unwrap().remove("event_id");

    let outcome = collector.submit(missing_id.clone()).await;
    assert_eq!(
        outcome,
        SubmitOutcome::Rejected {
            reason: RejectionReason::MissingField {
                field: EventField::EventId
            }
        }
    );
    let outcome = collector.submit(json!(42)).await;
    assert_eq!(
        outcome,
        SubmitOutcome::Rejected {
            reason: RejectionReason::MalformedPayload
        }
    );

    let records = dlq.read_all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].original_payload, missing_id);
    assert_eq!(records[1].reason, RejectionReason::MalformedPayload);
    assert_eq!(dlq.stats().await.unwrap().total_entries, 2);
    assert_eq!(log.total_len(), 0);

    let stats = collector.stats();
    assert_eq!(stats.rejected_total(), 2);
    assert_eq!(stats.rejected.get("malformed_payload"), Some(&1));
    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_queued_jobs() {
    let log = Arc::new(InMemoryLog::new(2));
    let (collector, _) = collector_with(test_config(32), log.clone());

    let mut handles = Vec::new();
    for i in 0..20 {
        let collector = Arc::clone(&collector);
        handles.push(tokio::spawn(async move {
            collector.submit(valid_event(&format!("drain-{i}"), "modelC")).await
        }));
    }
    common::wait_for_condition(
        || collector.queue_len() == 20,
        std::time::Duration::from_secs(5),
        std::time::Duration::from_millis(5),
    )
    .await;

    collector.start().unwrap();
    collector.shutdown().await.unwrap();

    for handle in handles {
        assert!(matches!(handle.await.unwrap(), SubmitOutcome::Accepted { .. }));
    }
    assert_eq!(log.total_len(), 20);
}
