use super::sketch::LatencySketch;
use crate::window::{millis_to_datetime, WindowBounds};
use llm_telemetry_types::{AggregateRow, DimensionKey, Event};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Stable 64-bit identity of an event id, used for duplicate detection
pub fn event_fingerprint(event_id: &str) -> u64 {
    let digest = Sha256::digest(event_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// The part of an event that an accumulator folds in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub fingerprint: u64,
    pub event_time: i64,
    pub latency_ms: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub is_error: bool,
}

impl MetricDelta {
    pub fn from_event(event: &Event) -> Self {
        let metrics = event.metrics();
        Self {
            fingerprint: event_fingerprint(event.event_id()),
            event_time: event.event_time_millis(),
            latency_ms: metrics.latency_ms,
            tokens_in: metrics.tokens_in,
            tokens_out: metrics.tokens_out,
            is_error: metrics.status.is_error(),
        }
    }
}

/// Running aggregate for one open window and dimension key
///
/// Every field is an exact commutative fold, so the final row does not depend
/// on the order in which partitions or events are applied. Latency is summed
/// in whole microseconds for that reason. The accumulator also remembers
/// which partitions contributed. Duplicate detection lives in the state store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Accumulator {
    count: u64,
    error_count: u64,
    sum_latency_us: u64,
    min_latency_ms: Option<f64>,
    max_latency_ms: Option<f64>,
    sum_tokens_in: u64,
    sum_tokens_out: u64,
    sketch: LatencySketch,
    partitions: BTreeSet<u32>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event
    pub fn fold(&mut self, partition: u32, delta: &MetricDelta) {
        self.partitions.insert(partition);

        self.count += 1;
        if delta.is_error {
            self.error_count += 1;
        }
        self.sum_latency_us = self
            .sum_latency_us
            .saturating_add(latency_micros(delta.latency_ms));
        self.min_latency_ms = Some(
            self.min_latency_ms
                .map_or(delta.latency_ms, |min| min.min(delta.latency_ms)),
        );
        self.max_latency_ms = Some(
            self.max_latency_ms
                .map_or(delta.latency_ms, |max| max.max(delta.latency_ms)),
        );
        self.sum_tokens_in = self.sum_tokens_in.saturating_add(delta.tokens_in);
        self.sum_tokens_out = self.sum_tokens_out.saturating_add(delta.tokens_out);
        self.sketch.insert(delta.latency_ms);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Partitions that contributed at least one event
    pub fn partitions(&self) -> &BTreeSet<u32> {
        &self.partitions
    }

    /// Produces the output row; percentile estimates are clamped to `[min, max]`
    pub fn finalize(&self, bounds: WindowBounds, dimension_key: &DimensionKey) -> AggregateRow {
        let min = self.min_latency_ms.unwrap_or(0.0);
        let max = self.max_latency_ms.unwrap_or(0.0);
        let percentile = |q: f64| {
            self.sketch
                .quantile(q)
                .map(|estimate| estimate.clamp(min, max))
                .unwrap_or(0.0)
        };
        let sum_latency_ms = self.sum_latency_us as f64 / 1_000.0;
        let (avg, error_rate) = if self.count == 0 {
            (0.0, 0.0)
        } else {
            (
                sum_latency_ms / self.count as f64,
                self.error_count as f64 / self.count as f64,
            )
        };

        AggregateRow {
            window_start: millis_to_datetime(bounds.start),
            window_end: millis_to_datetime(bounds.end),
            dimension_key: dimension_key.clone(),
            count: self.count,
            error_count: self.error_count,
            error_rate,
            sum_latency_ms,
            avg_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
            p50_latency_ms: percentile(0.50),
            p95_latency_ms: percentile(0.95),
            p99_latency_ms: percentile(0.99),
            sum_tokens_in: self.sum_tokens_in,
            sum_tokens_out: self.sum_tokens_out,
        }
    }
}

fn latency_micros(latency_ms: f64) -> u64 {
    // validated latencies are finite and non-negative
    (latency_ms * 1_000.0).round() as u64
}
