//! Rejection taxonomy shared by the validator, the dead-letter queue and stats

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event fields referenced by rejection reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventField {
    EventId,
    EventTime,
    DimensionKey,
    LatencyMs,
    TokensIn,
    TokensOut,
}

impl EventField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventId => "event_id",
            Self::EventTime => "event_time",
            Self::DimensionKey => "dimension_key",
            Self::LatencyMs => "latency_ms",
            Self::TokensIn => "tokens_in",
            Self::TokensOut => "tokens_out",
        }
    }
}

/// Components of a dimension key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyComponent {
    Model,
    ModelVersion,
}

impl KeyComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::ModelVersion => "model_version",
        }
    }
}

/// Why an inbound event was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// A required field is absent or empty
    MissingField { field: EventField },
    /// A numeric or time field is outside its accepted range
    OutOfRange { field: EventField },
    /// A dimension key component is empty after trimming
    MalformedKey { component: KeyComponent },
    /// The payload could not be decoded into any known schema version
    MalformedPayload,
}

/// Reason kind without its payload, used as a counter label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    MissingField,
    OutOfRange,
    MalformedKey,
    MalformedPayload,
}

impl RejectionKind {
    pub const ALL: [RejectionKind; 4] = [
        RejectionKind::MissingField,
        RejectionKind::OutOfRange,
        RejectionKind::MalformedKey,
        RejectionKind::MalformedPayload,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingField => "missing_field",
            Self::OutOfRange => "out_of_range",
            Self::MalformedKey => "malformed_key",
            Self::MalformedPayload => "malformed_payload",
        }
    }
}

impl RejectionReason {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Self::MissingField { .. } => RejectionKind::MissingField,
            Self::OutOfRange { .. } => RejectionKind::OutOfRange,
            Self::MalformedKey { .. } => RejectionKind::MalformedKey,
            Self::MalformedPayload => RejectionKind::MalformedPayload,
        }
    }

    /// Stable snake_case label for dashboards
    pub fn label(&self) -> &'static str {
        self.kind().label()
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing field: {}", field.as_str()),
            Self::OutOfRange { field } => write!(f, "out of range: {}", field.as_str()),
            Self::MalformedKey { component } => {
                write!(f, "malformed dimension key: empty {}", component.as_str())
            }
            Self::MalformedPayload => write!(f, "malformed payload"),
        }
    }
}
