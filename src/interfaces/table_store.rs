//! Partitioned table storage interface.
//!
//! The backend contract the reconciliation protocol is built on: atomic
//! batches within a single partition, optimistic concurrency via an etag
//! column, and ordered range scans paginated through an opaque
//! continuation token. Nothing here spans partitions atomically.

use async_trait::async_trait;

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Errors that can occur during table operations.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// An insert hit an existing (partition, row) key.
    #[error("Row already exists: partition={partition_key}, row={row_key}")]
    RowExists {
        partition_key: String,
        row_key: String,
    },

    /// A conditional update found a different etag than expected.
    #[error("Etag check failed: partition={partition_key}, row={row_key}, expected {expected}, found {actual:?}")]
    EtagMismatch {
        partition_key: String,
        row_key: String,
        expected: u64,
        /// `None` when the row does not exist at all.
        actual: Option<u64>,
    },

    /// The addressed row does not exist.
    #[error("Row not found: partition={partition_key}, row={row_key}")]
    NotFound {
        partition_key: String,
        row_key: String,
    },

    /// A batch mixed rows from more than one partition.
    #[error("Batch crosses partitions: batch={batch_partition}, row={row_partition}")]
    CrossPartitionBatch {
        batch_partition: String,
        row_partition: String,
    },

    /// Row attributes failed to encode or decode.
    #[error("Attribute error: {0}")]
    Attributes(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl TableError {
    /// Whether this error is a write conflict (duplicate row or failed
    /// etag check) rather than an infrastructure failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TableError::RowExists { .. } | TableError::EtagMismatch { .. }
        )
    }
}

/// A single stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// Partition key; the atomicity boundary.
    pub partition_key: String,
    /// Row key; rows are ordered by (partition, row) key.
    pub row_key: String,
    /// Writer-assigned concurrency token.
    pub etag: u64,
    /// Row attributes as a JSON object.
    pub attrs: serde_json::Value,
}

/// One operation within an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert a new row; fails the batch with [`TableError::RowExists`]
    /// if the key is taken.
    Insert(TableRow),
    /// Replace an existing row, conditional on its current etag.
    Update {
        row: TableRow,
        expected_etag: u64,
    },
}

impl BatchOp {
    /// The row this operation writes.
    pub fn row(&self) -> &TableRow {
        match self {
            BatchOp::Insert(row) => row,
            BatchOp::Update { row, .. } => row,
        }
    }
}

/// An atomic batch of operations against one partition.
///
/// Either every operation applies or none do.
#[derive(Debug, Clone)]
pub struct TableBatch {
    /// The partition every row in the batch must belong to.
    pub partition_key: String,
    /// Operations applied in order.
    pub ops: Vec<BatchOp>,
}

impl TableBatch {
    /// Create a batch for a partition.
    pub fn new(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            ops: Vec::new(),
        }
    }

    /// Queue an insert.
    pub fn insert(&mut self, row: TableRow) -> &mut Self {
        self.ops.push(BatchOp::Insert(row));
        self
    }

    /// Queue a conditional update.
    pub fn update(&mut self, row: TableRow, expected_etag: u64) -> &mut Self {
        self.ops.push(BatchOp::Update { row, expected_etag });
        self
    }

    /// Verify all rows share the batch partition.
    pub fn validate(&self) -> Result<()> {
        for op in &self.ops {
            let row = op.row();
            if row.partition_key != self.partition_key {
                return Err(TableError::CrossPartitionBatch {
                    batch_partition: self.partition_key.clone(),
                    row_partition: row.partition_key.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Partition addressing for a range scan.
#[derive(Debug, Clone)]
pub enum Partition {
    /// Scan a single partition.
    Key(String),
    /// Scan every partition whose key starts with the prefix, in
    /// (partition, row) key order.
    Prefix(String),
}

/// Opaque continuation token. Scans are stateless: a token can be replayed
/// after an interruption and resumes from the same position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub(crate) after_partition: String,
    pub(crate) after_row: String,
}

/// A range scan request.
#[derive(Debug, Clone)]
pub struct RangeScan {
    /// Which partition(s) to scan.
    pub partition: Partition,
    /// Inclusive row-key lower bound within each partition.
    pub row_from: Option<String>,
    /// Exclusive row-key upper bound within each partition.
    pub row_to: Option<String>,
    /// Maximum rows per page.
    pub page_size: usize,
    /// Resume position from a previous page.
    pub continuation: Option<Continuation>,
}

impl RangeScan {
    /// Scan one whole partition.
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition: Partition::Key(partition_key.into()),
            row_from: None,
            row_to: None,
            page_size: DEFAULT_PAGE_SIZE,
            continuation: None,
        }
    }

    /// Scan all partitions under a prefix.
    pub fn prefix(partition_prefix: impl Into<String>) -> Self {
        Self {
            partition: Partition::Prefix(partition_prefix.into()),
            row_from: None,
            row_to: None,
            page_size: DEFAULT_PAGE_SIZE,
            continuation: None,
        }
    }

    /// Restrict the row-key range to `[from, to)`.
    pub fn rows(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.row_from = Some(from.into());
        self.row_to = Some(to.into());
        self
    }

    /// Resume from a continuation token.
    pub fn after(mut self, continuation: Continuation) -> Self {
        self.continuation = Some(continuation);
        self
    }
}

/// Default page size for scans.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// One page of scan results.
#[derive(Debug, Clone)]
pub struct Page {
    /// Rows in (partition, row) key order.
    pub rows: Vec<TableRow>,
    /// Token for the next page; `None` when the scan is complete.
    pub continuation: Option<Continuation>,
}

/// Interface for partitioned table storage.
///
/// Implementations:
/// - `MemoryTableStore`: in-process storage for standalone use and tests
/// - `SqliteTableStore`: SQLite storage emulating the partition contract
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Execute an atomic batch against one partition.
    ///
    /// Fails without applying anything when any insert hits an existing
    /// row or any conditional update misses its etag.
    async fn execute(&self, batch: TableBatch) -> Result<()>;

    /// Fetch a single row.
    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<TableRow>>;

    /// Delete a single row. Deleting an absent row is a
    /// [`TableError::NotFound`] outcome.
    async fn delete(&self, partition_key: &str, row_key: &str) -> Result<()>;

    /// Run one page of a range scan.
    async fn query(&self, scan: RangeScan) -> Result<Page>;
}
