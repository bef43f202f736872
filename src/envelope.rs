//! Record and envelope types for the persistence protocol.
//!
//! These are the shapes that travel between the event store, the pending
//! partition, and the message bus. Persistent and pending rows carry the
//! same envelope; pending rows additionally carry a back-reference to the
//! persistent row they correspond to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Statically-declared aggregate kind tag.
///
/// Supplied explicitly by the caller and used as the type component of
/// partition keys. Never derived from a runtime type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggregateKind(&'static str);

impl AggregateKind {
    /// Declare an aggregate kind.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The kind tag as a string slice.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A uniqueness-indexed property declared by a domain event.
///
/// `value: None` clears the index entry for this property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueProperty {
    /// Property name, unique per aggregate kind.
    pub name: String,
    /// New value, or `None` to remove the index entry.
    pub value: Option<String>,
}

/// A domain event as produced by an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Aggregate instance this event belongs to.
    pub source_id: Uuid,
    /// Aggregate version after applying this event. Versions increase by
    /// exactly 1 per event.
    pub version: u64,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Event payload.
    pub body: serde_json::Value,
    /// Timestamp the event was raised.
    pub raised_at: DateTime<Utc>,
    /// Uniqueness-indexed properties declared by this event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexed: Vec<UniqueProperty>,
}

/// Optional metadata supplied with a save.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Operation id linking events to an originating operation.
    pub operation_id: Option<Uuid>,
    /// Correlation token deduplicating causal retries.
    pub correlation_id: Option<Uuid>,
    /// Originating contributor/service.
    pub contributor: Option<String>,
}

impl SaveOptions {
    /// Options carrying only a correlation id.
    pub fn correlated(correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::default()
        }
    }
}

/// Envelope wrapping a serialized event for storage and delivery.
///
/// The message id is the idempotency token downstream consumers dedup on;
/// it is minted once at save time and preserved verbatim through the
/// pending partition and onto the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Idempotency token for downstream consumers.
    pub message_id: Uuid,
    /// Aggregate kind tag.
    pub kind: String,
    /// Aggregate instance id.
    pub source_id: Uuid,
    /// Aggregate version of the wrapped event.
    pub version: u64,
    /// Event type name.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: String,
    /// Operation id, when supplied at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    /// Correlation id, when supplied at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Contributor, when supplied at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor: Option<String>,
    /// Timestamp the wrapped event was raised.
    pub raised_at: DateTime<Utc>,
}

/// Pending-partition record: an envelope plus the back-reference to the
/// persistent row it mirrors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    /// The wrapped envelope.
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    /// Partition key of the persistent counterpart.
    pub persistent_partition_key: String,
    /// Row key of the persistent counterpart.
    pub persistent_row_key: String,
}

/// Aggregate identity record: the single source of truth for the next
/// expected version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Aggregate kind tag.
    pub kind: String,
    /// Aggregate instance id.
    pub source_id: Uuid,
    /// Current (last saved) version.
    pub version: u64,
}

/// Correlation record: exists purely as a uniqueness constraint against
/// duplicate causal retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRecord {
    /// The externally-supplied correlation token.
    pub correlation_id: Uuid,
}

/// Opaque serialized aggregate state with a version stamp.
///
/// Overwritten on every save; never versioned historically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memento {
    /// Aggregate instance id.
    pub source_id: Uuid,
    /// Version the state was captured at.
    pub version: u64,
    /// Serialized aggregate state.
    pub state: Vec<u8>,
}
