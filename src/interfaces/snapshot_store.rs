//! Snapshot (memento) storage interface.

use async_trait::async_trait;
use uuid::Uuid;

use crate::envelope::Memento;

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors that can occur during snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Interface for memento persistence.
///
/// Mementos are an optional read-path optimization: when one exists,
/// aggregate reconstruction replays only events past its version stamp.
/// Each save overwrites the previous memento for that aggregate.
///
/// Implementations:
/// - `MemorySnapshotStore`: in-process storage
/// - `SqliteSnapshotStore`: SQLite storage
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a memento, replacing any existing one for its aggregate.
    async fn save(&self, memento: Memento) -> Result<()>;

    /// Retrieve the memento for an aggregate, if any.
    async fn find(&self, source_id: Uuid) -> Result<Option<Memento>>;

    /// Delete the memento for an aggregate.
    async fn delete(&self, source_id: Uuid) -> Result<()>;
}
