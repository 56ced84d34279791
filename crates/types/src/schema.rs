//! Versioned wire schema for inbound events
//!
//! Producers send JSON objects tagged with a top-level `schema_version`.
//! Version 1 is the legacy flat layout, version 2 the nested current one.
//! Everything downstream of decoding works on [`RawEventV2`]; older payloads
//! are migrated with [`migrate_v1`].

use crate::events::EventStatus;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Schema version produced by current clients
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Model version assigned to legacy events that did not carry one
pub const UNVERSIONED: &str = "unversioned";

/// Errors raised while decoding a raw payload into a known schema version
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("schema_version must be a non-negative integer")]
    InvalidVersion,

    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(u64),

    #[error("payload does not match schema v{version}: {details}")]
    Decode { version: u32, details: String },
}

/// Event timestamp as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Milliseconds since the Unix epoch
    Millis(i64),
    /// RFC 3339 string
    Text(String),
}

/// Legacy flat event layout
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEventV1 {
    pub event_id: Option<String>,
    pub timestamp: Option<RawTimestamp>,
    pub model: Option<String>,
    pub model_version: Option<String>,
    pub latency_ms: Option<f64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    /// Error class; presence marks the request as failed
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawDimension {
    pub model: Option<String>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawMetrics {
    pub latency_ms: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
}

/// Current nested event layout
///
/// Every field is optional at this level; presence and ranges are enforced
/// by the validator so that each failure maps onto a precise rejection reason.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEventV2 {
    pub event_id: Option<String>,
    pub event_time: Option<RawTimestamp>,
    pub dimension: Option<RawDimension>,
    pub metrics: Option<RawMetrics>,
    pub status: Option<EventStatus>,
}

/// A decoded but not yet validated event
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    V1(RawEventV1),
    V2(RawEventV2),
}

impl RawEvent {
    /// Decode a JSON value, dispatching on its `schema_version`
    pub fn from_value(value: serde_json::Value) -> Result<Self, SchemaError> {
        let object = value.as_object().ok_or(SchemaError::NotAnObject)?;

        let version = match object.get("schema_version") {
            None | Some(serde_json::Value::Null) => u64::from(CURRENT_SCHEMA_VERSION),
            Some(v) => v.as_u64().ok_or(SchemaError::InvalidVersion)?,
        };

        match version {
            1 => serde_json::from_value(value)
                .map(RawEvent::V1)
                .map_err(|e| SchemaError::Decode {
                    version: 1,
                    details: e.to_string(),
                }),
            2 => serde_json::from_value(value)
                .map(RawEvent::V2)
                .map_err(|e| SchemaError::Decode {
                    version: 2,
                    details: e.to_string(),
                }),
            other => Err(SchemaError::UnsupportedVersion(other)),
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            RawEvent::V1(_) => 1,
            RawEvent::V2(_) => 2,
        }
    }

    /// View this event in the current layout, migrating if needed
    pub fn to_current(&self) -> Cow<'_, RawEventV2> {
        match self {
            RawEvent::V1(v1) => Cow::Owned(migrate_v1(v1.clone())),
            RawEvent::V2(v2) => Cow::Borrowed(v2),
        }
    }

    pub fn into_current(self) -> RawEventV2 {
        match self {
            RawEvent::V1(v1) => migrate_v1(v1),
            RawEvent::V2(v2) => v2,
        }
    }
}

impl From<RawEventV2> for RawEvent {
    fn from(raw: RawEventV2) -> Self {
        RawEvent::V2(raw)
    }
}

/// Migrate a legacy v1 event to the v2 layout
///
/// Missing token counts become zero and a missing model version becomes
/// [`UNVERSIONED`]. Required fields stay absent so the validator reports them.
pub fn migrate_v1(v1: RawEventV1) -> RawEventV2 {
    let dimension = if v1.model.is_none() && v1.model_version.is_none() {
        None
    } else {
        Some(RawDimension {
            model: v1.model,
            model_version: Some(v1.model_version.unwrap_or_else(|| UNVERSIONED.to_string())),
        })
    };

    let status = match v1.error {
        Some(class) if class.trim().is_empty() => EventStatus::Error("unknown".to_string()),
        Some(class) => EventStatus::Error(class),
        None => EventStatus::Success,
    };

    RawEventV2 {
        event_id: v1.event_id,
        event_time: v1.timestamp,
        dimension,
        metrics: Some(RawMetrics {
            latency_ms: v1.latency_ms,
            tokens_in: Some(v1.prompt_tokens.unwrap_or(0)),
            tokens_out: Some(v1.completion_tokens.unwrap_or(0)),
        }),
        status: Some(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_version_defaults_to_current() {
        let raw = RawEvent::from_value(json!({
            "event_id": "a",
            "event_time": 1000,
            "dimension": {"model": "m", "model_version": "v"},
            "metrics": {"latency_ms": 10.0, "tokens_in": 1, "tokens_out": 2}
        }))
        .unwrap();

        assert_eq!(raw.schema_version(), 2);
        let current = raw.into_current();
        assert_eq!(current.event_time, Some(RawTimestamp::Millis(1000)));
        assert_eq!(current.status, None);
    }

    #[test]
    fn test_v1_migration() {
        let raw = RawEvent::from_value(json!({
            "schema_version": 1,
            "event_id": "legacy",
            "timestamp": "2024-01-01T00:00:00Z",
            "model": "gpt-3.5",
            "latency_ms": 42.5,
            "prompt_tokens": 7,
            "error": "timeout"
        }))
        .unwrap();

        assert_eq!(raw.schema_version(), 1);
        let current = raw.to_current().into_owned();
        let dimension = current.dimension.unwrap();
        assert_eq!(dimension.model.as_deref(), Some("gpt-3.5"));
        assert_eq!(dimension.model_version.as_deref(), Some(UNVERSIONED));

        let metrics = current.metrics.unwrap();
        assert_eq!(metrics.tokens_in, Some(7));
        assert_eq!(metrics.tokens_out, Some(0));
        assert_eq!(current.status, Some(EventStatus::Error("timeout".to_string())));
    }

    #[test]
    fn test_v2_status_forms() {
        let ok = RawEvent::from_value(json!({"status": "success"})).unwrap();
        assert_eq!(ok.into_current().status, Some(EventStatus::Success));

        let failed = RawEvent::from_value(json!({"status": {"error": "rate_limited"}})).unwrap();
        assert_eq!(
            failed.into_current().status,
            Some(EventStatus::Error("rate_limited".to_string()))
        );
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = RawEvent::from_value(json!({"schema_version": 9})).unwrap_err();
        assert_eq!(err, SchemaError::UnsupportedVersion(9));

        let err = RawEvent::from_value(json!({"schema_version": "two"})).unwrap_err();
        assert_eq!(err, SchemaError::InvalidVersion);
    }

    #[test]
    fn test_non_object_and_bad_types_rejected() {
        assert_eq!(
            RawEvent::from_value(json!([1, 2, 3])).unwrap_err(),
            SchemaError::NotAnObject
        );

        let err = RawEvent::from_value(json!({"metrics": {"latency_ms": "fast"}})).unwrap_err();
        assert!(matches!(err, SchemaError::Decode { version: 2, .. }));
    }
}
