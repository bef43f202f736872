//! Event payload serialization interface.

use crate::envelope::DomainEvent;

/// Result type for serializer operations.
pub type Result<T> = std::result::Result<T, SerializerError>;

/// Errors that can occur during payload (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("Failed to serialize event: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to deserialize event: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Converts a domain event to and from its stored text payload.
pub trait EventSerializer: Send + Sync {
    /// Render an event as a text payload.
    fn serialize(&self, event: &DomainEvent) -> Result<String>;

    /// Reconstruct an event from a text payload.
    fn deserialize(&self, text: &str) -> Result<DomainEvent>;
}

/// JSON serializer; the default payload format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn serialize(&self, event: &DomainEvent) -> Result<String> {
        serde_json::to_string(event).map_err(SerializerError::Serialize)
    }

    fn deserialize(&self, text: &str) -> Result<DomainEvent> {
        serde_json::from_str(text).map_err(SerializerError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_json_roundtrip() {
        let event = DomainEvent {
            source_id: Uuid::new_v4(),
            version: 7,
            event_type: "NameChanged".to_string(),
            body: serde_json::json!({"name": "ada"}),
            raised_at: Utc::now(),
            indexed: vec![],
        };

        let serializer = JsonEventSerializer;
        let text = serializer.serialize(&event).unwrap();
        let back = serializer.deserialize(&text).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let serializer = JsonEventSerializer;
        assert!(serializer.deserialize("not json").is_err());
    }
}
