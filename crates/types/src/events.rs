//! Event types for the telemetry pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Composite grouping key for aggregation (model + model version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionKey {
    /// Model identifier, e.g. `gpt-4o`
    pub model: String,
    /// Model version, e.g. `2024-08-06`
    pub model_version: String,
}

impl DimensionKey {
    /// Create a new dimension key
    pub fn new(model: impl Into<String>, model_version: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            model_version: model_version.into(),
        }
    }

    /// Derive the log partition key for this dimension key.
    ///
    /// The derivation is a SHA-256 over the length-prefixed components, so it is
    /// stable across restarts, processes and compiler versions.
    pub fn partition_key(&self) -> PartitionKey {
        let mut hasher = Sha256::new();
        for component in [&self.model, &self.model_version] {
            hasher.update((component.len() as u64).to_be_bytes());
            hasher.update(component.as_bytes());
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        PartitionKey(u64::from_be_bytes(prefix))
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model, self.model_version)
    }
}

/// Key used to route events to log partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(pub u64);

impl PartitionKey {
    /// Big-endian byte representation handed to the log client
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Outcome classification of the request described by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Success,
    /// Failed request with an error class (e.g. `timeout`, `rate_limited`)
    Error(String),
}

impl EventStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Numeric measurements carried by an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetrics {
    /// End-to-end latency in milliseconds
    pub latency_ms: f64,
    /// Prompt / input tokens
    pub tokens_in: u64,
    /// Completion / output tokens
    pub tokens_out: u64,
    /// Success or error classification
    #[serde(default)]
    pub status: EventStatus,
}

/// A validated telemetry event
///
/// Events are immutable once created: the event time and dimension key cannot
/// change, and the partition key is always derived from the dimension key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,
    event_time: DateTime<Utc>,
    dimension_key: DimensionKey,
    partition_key: PartitionKey,
    metrics: EventMetrics,
}

impl Event {
    /// Create a new event, deriving its partition key
    pub fn new(
        event_id: impl Into<String>,
        event_time: DateTime<Utc>,
        dimension_key: DimensionKey,
        metrics: EventMetrics,
    ) -> Self {
        let partition_key = dimension_key.partition_key();
        Self {
            event_id: event_id.into(),
            event_time,
            dimension_key,
            partition_key,
            metrics,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    /// Event time in milliseconds since the Unix epoch
    pub fn event_time_millis(&self) -> i64 {
        self.event_time.timestamp_millis()
    }

    pub fn dimension_key(&self) -> &DimensionKey {
        &self.dimension_key
    }

    pub fn partition_key(&self) -> PartitionKey {
        self.partition_key
    }

    pub fn metrics(&self) -> &EventMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metrics() -> EventMetrics {
        EventMetrics {
            latency_ms: 120.0,
            tokens_in: 10,
            tokens_out: 20,
            status: EventStatus::Success,
        }
    }

    #[test]
    fn test_partition_key_is_deterministic() {
        let a = DimensionKey::new("gpt-4o", "2024-08-06");
        let b = DimensionKey::new("gpt-4o", "2024-08-06");
        assert_eq!(a.partition_key(), b.partition_key());
    }

    #[test]
    fn test_partition_key_components_are_length_prefixed() {
        let a = DimensionKey::new("ab", "c");
        let b = DimensionKey::new("a", "bc");
        assert_ne!(a.partition_key(), b.partition_key());
    }

    #[test]
    fn test_event_derives_partition_key() {
        let key = DimensionKey::new("claude", "3");
        let event = Event::new(
            "evt-1",
            Utc.timestamp_millis_opt(1_000).unwrap(),
            key.clone(),
            metrics(),
        );
        assert_eq!(event.partition_key(), key.partition_key());
        assert_eq!(event.event_time_millis(), 1_000);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            "evt-2",
            Utc.timestamp_millis_opt(5_000).unwrap(),
            DimensionKey::new("m", "v"),
            EventMetrics {
                status: EventStatus::Error("timeout".to_string()),
                ..metrics()
            },
        );

        let json = serde_json::to_vec(&event).unwrap();
        let decoded: Event = serde_json::from_slice(&json).unwrap();
        assert_eq!(event, decoded);
        assert!(decoded.metrics().status.is_error());
    }

    #[test]
    fn test_dimension_key_display() {
        assert_eq!(DimensionKey::new("modelA", "v1").to_string(), "modelA@v1");
    }
}
