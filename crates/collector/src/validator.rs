//! Event validation
//!
//! Turns decoded raw events into typed [`Event`]s or a [`RejectionReason`].
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. required fields present (`event_id`, `event_time`, dimension key, `latency_ms`)
//! 2. `event_time` representable, `latency_ms` finite and within limits
//! 3. token counts within limits
//! 4. dimension key components non-empty after trimming
//!
//! The validator holds only immutable limits, so one instance can be shared
//! across any number of concurrent submitters.

use chrono::{DateTime, TimeZone, Utc};
use llm_telemetry_types::schema::RawTimestamp;
use llm_telemetry_types::{
    DimensionKey, Event, EventField, EventMetrics, KeyComponent, RawEvent, RawEventV2,
    RejectionReason,
};
use tracing::trace;

/// Upper bounds applied during validation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorLimits {
    pub max_latency_ms: f64,
    pub max_tokens: u64,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_latency_ms: 600_000.0,
            max_tokens: 2_000_000,
        }
    }
}

/// Validation result
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Accept(Event),
    Reject(RejectionReason),
}

impl Validation {
    pub fn is_accept(&self) -> bool {
        matches!(self, Validation::Accept(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventValidator {
    limits: ValidatorLimits,
}

impl EventValidator {
    pub fn new(limits: ValidatorLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ValidatorLimits {
        self.limits
    }

    /// Decode a JSON payload and validate it
    pub fn validate_value(&self, payload: &serde_json::Value) -> Validation {
        match RawEvent::from_value(payload.clone()) {
            Ok(raw) => self.validate(&raw),
            Err(e) => {
                trace!(error = %e, "Undecodable payload");
                Validation::Reject(RejectionReason::MalformedPayload)
            }
        }
    }

    /// Validate a decoded event of any schema version
    pub fn validate(&self, raw: &RawEvent) -> Validation {
        match self.check(&raw.to_current()) {
            Ok(event) => Validation::Accept(event),
            Err(reason) => Validation::Reject(reason),
        }
    }

    fn check(&self, raw: &RawEventV2) -> Result<Event, RejectionReason> {
        // Presence
        let event_id = raw
            .event_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(missing(EventField::EventId))?;
        let event_time = raw.event_time.as_ref().ok_or(missing(EventField::EventTime))?;
        let dimension = raw.dimension.as_ref().ok_or(missing(EventField::DimensionKey))?;
        let model = dimension
            .model
            .as_deref()
            .ok_or(missing(EventField::DimensionKey))?;
        let model_version = dimension
            .model_version
            .as_deref()
            .ok_or(missing(EventField::DimensionKey))?;
        let metrics = raw.metrics.clone().unwrap_or_default();
        let latency_ms = metrics.latency_ms.ok_or(missing(EventField::LatencyMs))?;

        // Ranges
        let event_time = parse_event_time(event_time).ok_or(out_of_range(EventField::EventTime))?;
        if !latency_ms.is_finite() || latency_ms < 0.0 || latency_ms > self.limits.max_latency_ms {
            return Err(out_of_range(EventField::LatencyMs));
        }
        let tokens_in = self.check_tokens(metrics.tokens_in, EventField::TokensIn)?;
        let tokens_out = self.check_tokens(metrics.tokens_out, EventField::TokensOut)?;

        // Key shape
        let model = model.trim();
        if model.is_empty() {
            return Err(RejectionReason::MalformedKey {
                component: KeyComponent::Model,
            });
        }
        let model_version = model_version.trim();
        if model_version.is_empty() {
            return Err(RejectionReason::MalformedKey {
                component: KeyComponent::ModelVersion,
            });
        }

        Ok(Event::new(
            event_id,
            event_time,
            DimensionKey::new(model, model_version),
            EventMetrics {
                latency_ms,
                tokens_in,
                tokens_out,
                status: raw.status.clone().unwrap_or_default(),
            },
        ))
    }

    fn check_tokens(&self, value: Option<i64>, field: EventField) -> Result<u64, RejectionReason> {
        let value = value.unwrap_or(0);
        u64::try_from(value)
            .ok()
            .filter(|v| *v <= self.limits.max_tokens)
            .ok_or(out_of_range(field))
    }
}

fn missing(field: EventField) -> RejectionReason {
    RejectionReason::MissingField { field }
}

fn out_of_range(field: EventField) -> RejectionReason {
    RejectionReason::OutOfRange { field }
}

fn parse_event_time(raw: &RawTimestamp) -> Option<DateTime<Utc>> {
    match raw {
        RawTimestamp::Millis(millis) => Utc.timestamp_millis_opt(*millis).single(),
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_telemetry_types::EventStatus;
    use serde_json::{json, Value};

    fn valid() -> Value {
        json!({
            "event_id": "evt-1",
            "event_time": "2024-05-01T12:00:00Z",
            "dimension": {"model": "modelA", "model_version": "v1"},
            "metrics": {"latency_ms": 250.0, "tokens_in": 100, "tokens_out": 40}
        })
    }

    fn reject(payload: Value) -> RejectionReason {
        match EventValidator::default().validate_value(&payload) {
            Validation::Reject(reason) => reason,
            Validation::Accept(event) => panic!("expected rejection, got {:?}", event),
        }
    }

    #[test]
    fn test_accepts_valid_event() {
        let validation = EventValidator::default().validate_value(&valid());
        let Validation::Accept(event) = validation else {
            panic!("expected accept");
        };
        assert_eq!(event.event_id(), "evt-1");
        assert_eq!(event.dimension_key(), &DimensionKey::new("modelA", "v1"));
        assert_eq!(event.metrics().tokens_in, 100);
        assert_eq!(event.metrics().status, EventStatus::Success);
    }

    #[test]
    fn test_missing_fields() {
        for (pointer, field) in [
            ("event_id", EventField::EventId),
            ("event_time", EventField::EventTime),
            ("dimension", EventField::DimensionKey),
        ] {
            let mut payload = valid();
            payload.as_object_mut().unwrap().remove(pointer);
            assert_eq!(reject(payload), RejectionReason::MissingField { field });
        }

        let mut payload = valid();
        payload["metrics"].as_object_mut().unwrap().remove("latency_ms");
        assert_eq!(
            reject(payload),
            RejectionReason::MissingField {
                field: EventField::LatencyMs
            }
        );
    }

    #[test]
    fn test_blank_event_id_is_missing() {
        let mut payload = valid();
        payload["event_id"] = json!("   ");
        assert_eq!(
            reject(payload),
            RejectionReason::MissingField {
                field: EventField::EventId
            }
        );
    }

    #[test]
    fn test_validation_is_deterministic() {
        let mut payload = valid();
        payload.as_object_mut().unwrap().remove("event_id");
        let validator = EventValidator::default();
        let first = validator.validate_value(&payload);
        for _ in 0..10 {
            assert_eq!(validator.validate_value(&payload), first);
        }
    }

    #[test]
    fn test_latency_range() {
        for latency in [-1.0, 600_001.0] {
            let mut payload = valid();
            payload["metrics"]["latency_ms"] = json!(latency);
            assert_eq!(
                reject(payload),
                RejectionReason::OutOfRange {
                    field: EventField::LatencyMs
                }
            );
        }
    }

    #[test]
    fn test_token_range() {
        let mut payload = valid();
        payload["metrics"]["tokens_in"] = json!(-5);
        assert_eq!(
            reject(payload),
            RejectionReason::OutOfRange {
                field: EventField::TokensIn
            }
        );

        let mut payload = valid();
        payload["metrics"]["tokens_out"] = json!(2_000_001);
        assert_eq!(
            reject(payload),
            RejectionReason::OutOfRange {
                field: EventField::TokensOut
            }
        );
    }

    #[test]
    fn test_missing_field_checked_before_range() {
        let mut payload = valid();
        payload["metrics"]["latency_ms"] = json!(-1.0);
        payload.as_object_mut().unwrap().remove("event_time");
        assert_eq!(
            reject(payload),
            RejectionReason::MissingField {
                field: EventField::EventTime
            }
        );
    }

    #[test]
    fn test_malformed_key() {
        let mut payload = valid();
        payload["dimension"]["model"] = json!("  ");
        assert_eq!(
            reject(payload),
            RejectionReason::MalformedKey {
                component: KeyComponent::Model
            }
        );

        let mut payload = valid();
        payload["dimension"]["model_version"] = json!("");
        assert_eq!(
            reject(payload),
            RejectionReason::MalformedKey {
                component: KeyComponent::ModelVersion
            }
        );
    }

    #[test]
    fn test_bad_timestamp_is_out_of_range() {
        let mut payload = valid();
        payload["event_time"] = json!("yesterday");
        assert_eq!(
            reject(payload),
            RejectionReason::OutOfRange {
                field: EventField::EventTime
            }
        );
    }

    #[test]
    fn test_malformed_payload() {
        assert_eq!(reject(json!("not an object")), RejectionReason::MalformedPayload);
        assert_eq!(
            reject(json!({"schema_version": 7})),
            RejectionReason::MalformedPayload
        );
    }

    #[test]
    fn test_legacy_event_accepted() {
        let payload = json!({
            "schema_version": 1,
            "event_id": "old-1",
            "timestamp": 1_700_000_000_000i64,
            "model": "modelB",
            "latency_ms": 80.0,
            "prompt_tokens": 3,
            "completion_tokens": 4,
            "error": "timeout"
        });
        let Validation::Accept(event) = EventValidator::default().validate_value(&payload) else {
            panic!("expected accept");
        };
        assert_eq!(event.dimension_key().model_version, "unversioned");
        assert!(event.metrics().status.is_error());
        assert_eq!(event.event_time_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_custom_limits() {
        let validator = EventValidator::new(ValidatorLimits {
            max_latency_ms: 100.0,
            max_tokens: 10,
        });
        assert!(!validator.validate_value(&valid()).is_accept());
    }
}
