//! Shared helpers for processor integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use eventlog::{InMemoryLog, LogRecord};
use llm_telemetry_types::{DimensionKey, Event, EventMetrics, EventStatus};
use processor::AggregatorConfig;
use std::time::Duration;

/// Start of the window most tests aggregate into
pub fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn at(offset_ms: i64) -> DateTime<Utc> {
    window_start() + ChronoDuration::milliseconds(offset_ms)
}

pub fn event(id: &str, model: &str, time: DateTime<Utc>, latency_ms: f64) -> Event {
    Event::new(
        id,
        time,
        DimensionKey::new(model, "v1"),
        EventMetrics {
            latency_ms,
            tokens_in: 10,
            tokens_out: 20,
            status: EventStatus::Success,
        },
    )
}

pub fn payload(event: &Event) -> Vec<u8> {
    serde_json::to_vec(event).unwrap()
}

/// Records of one partition as the consumer would deliver them
pub fn partition_records(log: &InMemoryLog, partition: u32) -> Vec<LogRecord> {
    log.records(partition)
        .into_iter()
        .enumerate()
        .map(|(offset, payload)| LogRecord {
            partition,
            offset: offset as u64,
            payload,
        })
        .collect()
}

pub fn test_config() -> AggregatorConfig {
    AggregatorConfig {
        window_size: Duration::from_secs(60),
        allowed_lateness: Duration::from_secs(10),
        idle_timeout: None,
        batch_size: 64,
        idle_tick: Duration::from_millis(10),
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(10),
        ..AggregatorConfig::default()
    }
}

/// Polls an async condition until it holds or the timeout expires
pub async fn eventually<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
