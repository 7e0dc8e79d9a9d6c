//! The message body carried from the publisher to the consumer.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Record, RecordError};

pub const RECORD_CREATED: &str = "applicant.created";
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordEnvelope {
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    pub source: String,
    pub record: Record,
}

impl RecordEnvelope {
    pub fn new(source: &str, record: Record) -> Self {
        Self {
            event_type: RECORD_CREATED.to_owned(),
            received_at: Utc::now(),
            source: source.to_owned(),
            record,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a message body. A body that fails here fails the same way on every redelivery.
    /// Records without an identity key decode fine: they are stored without deduplication.
    pub fn decode(body: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_malformed_bodies() {
        assert!(matches!(
            RecordEnvelope::decode(b"not json"),
            Err(RecordError::DecodeError(_))
        ));
        assert!(matches!(
            RecordEnvelope::decode(br#"{"event_type": "applicant.created"}"#),
            Err(RecordError::DecodeError(_))
        ));
        assert!(matches!(
            RecordEnvelope::decode(
                br#"{"event_type": "applicant.created", "received_at": "2026-02-01T00:00:00Z", "source": "web-api", "record": [1]}"#
            ),
            Err(RecordError::DecodeError(_))
        ));
    }

    #[test]
    fn test_decode_accepts_published_envelopes() {
        let envelope = RecordEnvelope::new(
            "web-api",
            Record {
                url: Some("https://example.com/result/5".to_owned()),
                program: Some("Physics".to_owned()),
                gpa: Some(3.7),
                ..Default::default()
            },
        );

        let decoded = RecordEnvelope::decode(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.event_type, RECORD_CREATED);
    }
}
