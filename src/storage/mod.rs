//! Storage backends.

use std::sync::Arc;

use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::interfaces::{SnapshotStore, TableStore};
use crate::store::UniqueIndexStore;

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemorySnapshotStore, MemoryTableStore, MemoryUniqueIndexStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteSnapshotStore, SqliteTableStore, SqliteUniqueIndexStore};

/// Backend handles wired from configuration.
pub struct Backends {
    /// Partitioned table store carrying events, identity, and
    /// correlation rows.
    pub tables: Arc<dyn TableStore>,
    /// Memento storage.
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Unique-property index, where the backend supports one.
    pub unique_index: Option<Arc<dyn UniqueIndexStore>>,
}

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
) -> Result<Backends, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Memory => {
            info!("Storage: memory");
            Ok(Backends {
                tables: Arc::new(MemoryTableStore::new()),
                snapshots: Arc::new(MemorySnapshotStore::new()),
                unique_index: Some(Arc::new(MemoryUniqueIndexStore::new())),
            })
        }
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            info!("Storage: sqlite at {}", config.sqlite.path);

            if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.sqlite.path))
                    .await?;

            let tables = Arc::new(SqliteTableStore::new(pool.clone()));
            tables.init().await?;

            let snapshots = Arc::new(SqliteSnapshotStore::new(pool.clone()));
            snapshots.init().await?;

            let unique_index = Arc::new(SqliteUniqueIndexStore::new(pool));
            unique_index.init().await?;

            Ok(Backends {
                tables,
                snapshots,
                unique_index: Some(unique_index),
            })
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            Err("SQLite storage requested but 'sqlite' feature is not enabled".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{TableBatch, TableRow};

    #[tokio::test]
    async fn test_init_memory_storage() {
        let config = StorageConfig {
            storage_type: StorageType::Memory,
            ..StorageConfig::default()
        };
        let backends = init_storage(&config).await.unwrap();
        assert!(backends.unique_index.is_some());

        let mut batch = TableBatch::new("p1");
        batch.insert(TableRow {
            partition_key: "p1".to_string(),
            row_key: "a".to_string(),
            etag: 1,
            attrs: serde_json::json!({}),
        });
        backends.tables.execute(batch).await.unwrap();
        assert!(backends.tables.get("p1", "a").await.unwrap().is_some());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_init_sqlite_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caisson.db");
        let config = StorageConfig {
            storage_type: StorageType::Sqlite,
            sqlite: crate::config::SqliteConfig {
                path: path.to_string_lossy().into_owned(),
            },
        };
        let backends = init_storage(&config).await.unwrap();
        assert!(backends.tables.get("p1", "missing").await.unwrap().is_none());
    }
}
