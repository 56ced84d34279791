//! Materialized aggregate rows

use crate::events::DimensionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One finalized row per (window, dimension key)
///
/// A row carries no emission timestamp, so redelivering the same window
/// produces a byte-identical row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub dimension_key: DimensionKey,
    pub count: u64,
    pub error_count: u64,
    /// `error_count / count`
    pub error_rate: f64,
    pub sum_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub sum_tokens_in: u64,
    pub sum_tokens_out: u64,
}

impl AggregateRow {
    /// Upsert key for sinks: window start in millis plus dimension key
    pub fn key(&self) -> (i64, &DimensionKey) {
        (self.window_start.timestamp_millis(), &self.dimension_key)
    }
}
