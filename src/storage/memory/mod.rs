//! In-memory storage backend.
//!
//! Standalone/test backend with the same contract as the real table
//! stores: per-partition batch atomicity, etag checks, and genuine
//! continuation-token pagination so scan loops get exercised.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::envelope::Memento;
use crate::interfaces::snapshot_store::{self, SnapshotStore};
use crate::interfaces::table_store::{
    BatchOp, Continuation, Page, Partition, RangeScan, Result, TableBatch, TableError, TableRow,
    TableStore,
};
use crate::store::unique::{self, PropertyChange, UniqueIndexError, UniqueIndexStore};

#[derive(Debug, Clone)]
struct Stored {
    etag: u64,
    attrs: serde_json::Value,
}

/// In-memory table store keyed by (partition, row).
#[derive(Default)]
pub struct MemoryTableStore {
    rows: RwLock<BTreeMap<(String, String), Stored>>,
}

impl MemoryTableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total row count, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the store holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn execute(&self, batch: TableBatch) -> Result<()> {
        batch.validate()?;
        let mut rows = self.rows.write().await;

        // Check every op before applying any: the batch is all-or-nothing.
        for op in &batch.ops {
            let row = op.row();
            let key = (row.partition_key.clone(), row.row_key.clone());
            match op {
                BatchOp::Insert(_) => {
                    if rows.contains_key(&key) {
                        return Err(TableError::RowExists {
                            partition_key: row.partition_key.clone(),
                            row_key: row.row_key.clone(),
                        });
                    }
                }
                BatchOp::Update { expected_etag, .. } => match rows.get(&key) {
                    Some(stored) if stored.etag == *expected_etag => {}
                    other => {
                        return Err(TableError::EtagMismatch {
                            partition_key: row.partition_key.clone(),
                            row_key: row.row_key.clone(),
                            expected: *expected_etag,
                            actual: other.map(|s| s.etag),
                        });
                    }
                },
            }
        }

        for op in batch.ops {
            let (row, key) = match op {
                BatchOp::Insert(row) | BatchOp::Update { row, .. } => {
                    let key = (row.partition_key.clone(), row.row_key.clone());
                    (row, key)
                }
            };
            rows.insert(
                key,
                Stored {
                    etag: row.etag,
                    attrs: row.attrs,
                },
            );
        }
        Ok(())
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<TableRow>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&(partition_key.to_string(), row_key.to_string()))
            .map(|stored| TableRow {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
                etag: stored.etag,
                attrs: stored.attrs.clone(),
            }))
    }

    async fn delete(&self, partition_key: &str, row_key: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.remove(&(partition_key.to_string(), row_key.to_string())) {
            Some(_) => Ok(()),
            None => Err(TableError::NotFound {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
            }),
        }
    }

    async fn query(&self, scan: RangeScan) -> Result<Page> {
        let rows = self.rows.read().await;

        let start: Bound<(String, String)> = match &scan.continuation {
            Some(token) => Bound::Excluded((token.after_partition.clone(), token.after_row.clone())),
            None => match &scan.partition {
                Partition::Key(pk) => Bound::Included((
                    pk.clone(),
                    scan.row_from.clone().unwrap_or_default(),
                )),
                Partition::Prefix(prefix) => Bound::Included((prefix.clone(), String::new())),
            },
        };

        let mut page = Vec::new();
        for ((pk, rk), stored) in rows.range((start, Bound::Unbounded)) {
            match &scan.partition {
                Partition::Key(key) => {
                    if pk != key {
                        break;
                    }
                }
                Partition::Prefix(prefix) => {
                    if !pk.starts_with(prefix.as_str()) {
                        break;
                    }
                }
            }
            if let Some(from) = &scan.row_from {
                if rk < from {
                    continue;
                }
            }
            if let Some(to) = &scan.row_to {
                if rk >= to {
                    continue;
                }
            }

            page.push(TableRow {
                partition_key: pk.clone(),
                row_key: rk.clone(),
                etag: stored.etag,
                attrs: stored.attrs.clone(),
            });
            if page.len() == scan.page_size {
                break;
            }
        }

        let continuation = if page.len() == scan.page_size {
            page.last().map(|row| Continuation {
                after_partition: row.partition_key.clone(),
                after_row: row.row_key.clone(),
            })
        } else {
            None
        };

        Ok(Page {
            rows: page,
            continuation,
        })
    }
}

/// In-memory memento store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    mementos: RwLock<HashMap<Uuid, Memento>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, memento: Memento) -> snapshot_store::Result<()> {
        self.mementos
            .write()
            .await
            .insert(memento.source_id, memento);
        Ok(())
    }

    async fn find(&self, source_id: Uuid) -> snapshot_store::Result<Option<Memento>> {
        Ok(self.mementos.read().await.get(&source_id).cloned())
    }

    async fn delete(&self, source_id: Uuid) -> snapshot_store::Result<()> {
        self.mementos.write().await.remove(&source_id);
        Ok(())
    }
}

/// In-memory unique-property index.
#[derive(Default)]
pub struct MemoryUniqueIndexStore {
    // (kind, name, owner) -> (value, version)
    entries: RwLock<HashMap<(String, String, Uuid), (String, u64)>>,
}

impl MemoryUniqueIndexStore {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the owner of a value, for tests and diagnostics.
    pub async fn owner_of(&self, kind: &str, name: &str, value: &str) -> Option<Uuid> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|((k, n, _), (v, _))| k == kind && n == name && v == value)
            .map(|((_, _, owner), _)| *owner)
    }
}

#[async_trait]
impl UniqueIndexStore for MemoryUniqueIndexStore {
    async fn apply(&self, changes: &[PropertyChange]) -> unique::Result<()> {
        let mut entries = self.entries.write().await;

        // Violation check first: the whole batch applies or none of it.
        for change in changes {
            if let Some(value) = &change.value {
                let taken = entries.iter().any(|((kind, name, owner), (v, _))| {
                    kind == &change.kind
                        && name == &change.name
                        && v == value
                        && *owner != change.source_id
                });
                if taken {
                    let owner = entries
                        .iter()
                        .find(|((kind, name, _), (v, _))| {
                            kind == &change.kind && name == &change.name && v == value
                        })
                        .map(|((_, _, owner), _)| *owner)
                        .unwrap_or(Uuid::nil());
                    return Err(UniqueIndexError::Violation {
                        kind: change.kind.clone(),
                        name: change.name.clone(),
                        value: value.clone(),
                        owner,
                    });
                }
            }
        }

        for change in changes {
            let key = (
                change.kind.clone(),
                change.name.clone(),
                change.source_id,
            );
            match &change.value {
                Some(value) => {
                    entries.insert(key, (value.clone(), change.version));
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
