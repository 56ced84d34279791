//! Dead-letter records for rejected events

use crate::validation::RejectionReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A rejected inbound payload, kept verbatim with its rejection reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub original_payload: serde_json::Value,
    pub reason: RejectionReason,
    pub received_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(original_payload: serde_json::Value, reason: RejectionReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_payload,
            reason,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::EventField;

    #[test]
    fn test_dead_letter_record_roundtrip() {
        let record = DeadLetterRecord::new(
            serde_json::json!({"event_id": ""}),
            RejectionReason::MissingField {
                field: EventField::EventId,
            },
        );

        let line = serde_json::to_string(&record).unwrap();
        let decoded: DeadLetterRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded, record);
    }
}
