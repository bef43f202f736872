//! Unique indexed properties.
//!
//! Events may declare properties (e.g. a username) that must be globally
//! unique per aggregate kind. The index keeps one entry per (kind, name,
//! owner), enforces uniqueness on (kind, name, value), and is applied
//! before any event rows commit so a conflicting value fails the save
//! outright.

use async_trait::async_trait;
use uuid::Uuid;

use crate::envelope::{AggregateKind, DomainEvent};

/// Result type for unique-index operations.
pub type Result<T> = std::result::Result<T, UniqueIndexError>;

/// Errors that can occur while applying index changes.
#[derive(Debug, thiserror::Error)]
pub enum UniqueIndexError {
    /// The value is already owned by a different aggregate.
    #[error("Unique property violation: {kind}.{name}={value} is owned by {owner}")]
    Violation {
        kind: String,
        name: String,
        value: String,
        owner: Uuid,
    },

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One index mutation derived from a saved event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    /// Aggregate kind tag.
    pub kind: String,
    /// Property name.
    pub name: String,
    /// New value; `None` removes the entry.
    pub value: Option<String>,
    /// Owning aggregate.
    pub source_id: Uuid,
    /// Version the value was set at.
    pub version: u64,
}

/// Interface for unique-property index storage.
///
/// Implementations:
/// - `MemoryUniqueIndexStore`: in-process index
/// - `SqliteUniqueIndexStore`: UNIQUE-constraint-backed index
#[async_trait]
pub trait UniqueIndexStore: Send + Sync {
    /// Apply a batch of changes atomically. A violation applies nothing.
    async fn apply(&self, changes: &[PropertyChange]) -> Result<()>;
}

/// Collect index changes from a batch of events, in event order. A later
/// event's change to the same property supersedes an earlier one.
pub fn collect_changes(kind: AggregateKind, events: &[DomainEvent]) -> Vec<PropertyChange> {
    let mut changes: Vec<PropertyChange> = Vec::new();
    for event in events {
        for property in &event.indexed {
            let change = PropertyChange {
                kind: kind.as_str().to_string(),
                name: property.name.clone(),
                value: property.value.clone(),
                source_id: event.source_id,
                version: event.version,
            };
            if let Some(existing) = changes.iter_mut().find(|c| c.name == change.name) {
                *existing = change;
            } else {
                changes.push(change);
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::UniqueProperty;
    use chrono::Utc;

    fn event(version: u64, indexed: Vec<UniqueProperty>) -> DomainEvent {
        DomainEvent {
            source_id: Uuid::new_v4(),
            version,
            event_type: "Test".to_string(),
            body: serde_json::json!({}),
            raised_at: Utc::now(),
            indexed,
        }
    }

    const KIND: AggregateKind = AggregateKind::new("User");

    #[test]
    fn test_collect_changes_empty_when_nothing_indexed() {
        let events = vec![event(1, vec![]), event(2, vec![])];
        assert!(collect_changes(KIND, &events).is_empty());
    }

    #[test]
    fn test_later_event_supersedes_earlier_value() {
        let events = vec![
            event(
                1,
                vec![UniqueProperty {
                    name: "username".to_string(),
                    value: Some("ada".to_string()),
                }],
            ),
            event(
                2,
                vec![UniqueProperty {
                    name: "username".to_string(),
                    value: Some("grace".to_string()),
                }],
            ),
        ];

        let changes = collect_changes(KIND, &events);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].value.as_deref(), Some("grace"));
        assert_eq!(changes[0].version, 2);
    }

    #[test]
    fn test_null_value_becomes_removal() {
        let events = vec![event(
            1,
            vec![UniqueProperty {
                name: "username".to_string(),
                value: None,
            }],
        )];

        let changes = collect_changes(KIND, &events);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].value.is_none());
    }
}
