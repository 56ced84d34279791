//! Common test utilities for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use collector::{Collector, CollectorConfig, MemoryDeadLetterQueue, RetryPolicy};
use eventlog::{InMemoryLog, LogClient, LogError, RecordPosition, RecordStream};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Log that fails the first `failures` publishes with a transient error
pub struct FlakyLog {
    inner: InMemoryLog,
    failures: AtomicU32,
    pub attempts: AtomicU32,
}

impl FlakyLog {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryLog::new(2),
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn published(&self) -> usize {
        self.inner.total_len()
    }
}

#[async_trait]
impl LogClient for FlakyLog {
    async fn publish(&self, partition_key: &[u8], payload: &[u8]) -> eventlog::Result<RecordPosition> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LogError::Unavailable("broker down".to_string()));
        }
        self.inner.publish(partition_key, payload).await
    }

    async fn consume(&self, partition: u32, from_offset: u64) -> eventlog::Result<RecordStream> {
        self.inner.consume(partition, from_offset).await
    }

    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }
}

/// Retry policy with millisecond delays
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
        max_attempts,
    }
}

pub fn test_config(queue_capacity: usize) -> CollectorConfig {
    CollectorConfig {
        queue_capacity,
        publisher_workers: 2,
        retry: fast_retry(5),
        shutdown_timeout: Duration::from_secs(5),
        ..CollectorConfig::default()
    }
}

pub fn collector_with(
    config: CollectorConfig,
    log: Arc<dyn LogClient>,
) -> (Arc<Collector>, Arc<MemoryDeadLetterQueue>) {
    let dlq = Arc::new(MemoryDeadLetterQueue::new());
    let collector = Collector::new(config, log, dlq.clone()).expect("valid config");
    (Arc::new(collector), dlq)
}

pub fn valid_event(id: &str, model: &str) -> Value {
    json!({
        "event_id": id,
        "event_time": "2024-05-01T12:00:00Z",
        "dimension": {"model": model, "model_version": "v1"},
        "metrics": {"latency_ms": 120.0, "tokens_in": 10, "tokens_out": 5}
    })
}

/// Wait for a condition to be true with timeout
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(check_interval).await;
    }
    false
}
