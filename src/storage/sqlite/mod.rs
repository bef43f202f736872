//! SQLite storage backend.
//!
//! Emulates the partitioned table contract over a single generic rows
//! table: batches run inside one `BEGIN IMMEDIATE` transaction, which
//! holds the write lock across the whole batch and so gives the same
//! all-or-nothing guarantee a partition-scoped batch would.

use async_trait::async_trait;
use sea_query::{Cond, Expr, LikeExpr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::envelope::Memento;
use crate::interfaces::snapshot_store::{self, SnapshotStore};
use crate::interfaces::table_store::{
    BatchOp, Continuation, Page, Partition, RangeScan, Result, TableBatch, TableError, TableRow,
    TableStore,
};
use crate::storage::schema::{
    Rows, Snapshots, UniqueProperties, CREATE_ROWS_TABLE, CREATE_SNAPSHOTS_TABLE,
    CREATE_UNIQUE_PROPERTIES_TABLE,
};
use crate::store::unique::{self, PropertyChange, UniqueIndexError, UniqueIndexStore};

/// Escape LIKE wildcards so a partition prefix matches literally.
fn like_prefix(prefix: &str) -> LikeExpr {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    LikeExpr::new(format!("{}%", escaped)).escape('\\')
}

/// SQLite implementation of the table store.
pub struct SqliteTableStore {
    pool: SqlitePool,
}

impl SqliteTableStore {
    /// Create a new SQLite table store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the schema.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(CREATE_ROWS_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    async fn current_etag(
        conn: &mut SqliteConnection,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<i64>> {
        let query = Query::select()
            .column(Rows::Etag)
            .from(Rows::Table)
            .and_where(Expr::col(Rows::PartitionKey).eq(partition_key))
            .and_where(Expr::col(Rows::RowKey).eq(row_key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        Ok(row.map(|r| r.get::<i64, _>("etag")))
    }

    async fn apply_ops(conn: &mut SqliteConnection, batch: &TableBatch) -> Result<()> {
        for op in &batch.ops {
            let row = op.row();
            let attrs = serde_json::to_string(&row.attrs)?;
            let existing = Self::current_etag(conn, &row.partition_key, &row.row_key).await?;

            match op {
                BatchOp::Insert(_) => {
                    if existing.is_some() {
                        return Err(TableError::RowExists {
                            partition_key: row.partition_key.clone(),
                            row_key: row.row_key.clone(),
                        });
                    }
                    let insert = Query::insert()
                        .into_table(Rows::Table)
                        .columns([Rows::PartitionKey, Rows::RowKey, Rows::Etag, Rows::Attrs])
                        .values_panic([
                            row.partition_key.clone().into(),
                            row.row_key.clone().into(),
                            (row.etag as i64).into(),
                            attrs.into(),
                        ])
                        .to_string(SqliteQueryBuilder);
                    sqlx::query(&insert).execute(&mut *conn).await?;
                }
                BatchOp::Update { expected_etag, .. } => {
                    match existing {
                        Some(etag) if etag == *expected_etag as i64 => {}
                        other => {
                            return Err(TableError::EtagMismatch {
                                partition_key: row.partition_key.clone(),
                                row_key: row.row_key.clone(),
                                expected: *expected_etag,
                                actual: other.map(|e| e as u64),
                            });
                        }
                    }
                    let update = Query::update()
                        .table(Rows::Table)
                        .value(Rows::Etag, row.etag as i64)
                        .value(Rows::Attrs, attrs)
                        .and_where(Expr::col(Rows::PartitionKey).eq(row.partition_key.as_str()))
                        .and_where(Expr::col(Rows::RowKey).eq(row.row_key.as_str()))
                        .to_string(SqliteQueryBuilder);
                    sqlx::query(&update).execute(&mut *conn).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for SqliteTableStore {
    async fn execute(&self, batch: TableBatch) -> Result<()> {
        batch.validate()?;
        if batch.ops.is_empty() {
            return Ok(());
        }

        // BEGIN IMMEDIATE acquires the write lock upfront, preventing
        // deadlocks when concurrent DEFERRED transactions race to
        // upgrade from shared to exclusive.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::apply_ops(&mut conn, &batch).await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<TableRow>> {
        let query = Query::select()
            .columns([Rows::Etag, Rows::Attrs])
            .from(Rows::Table)
            .and_where(Expr::col(Rows::PartitionKey).eq(partition_key))
            .and_where(Expr::col(Rows::RowKey).eq(row_key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let etag: i64 = row.get("etag");
                let attrs: String = row.get("attrs");
                Ok(Some(TableRow {
                    partition_key: partition_key.to_string(),
                    row_key: row_key.to_string(),
                    etag: etag as u64,
                    attrs: serde_json::from_str(&attrs)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, partition_key: &str, row_key: &str) -> Result<()> {
        let delete = Query::delete()
            .from_table(Rows::Table)
            .and_where(Expr::col(Rows::PartitionKey).eq(partition_key))
            .and_where(Expr::col(Rows::RowKey).eq(row_key))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&delete).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(TableError::NotFound {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
            });
        }
        Ok(())
    }

    async fn query(&self, scan: RangeScan) -> Result<Page> {
        let query = {
            let mut select = Query::select();
            select
                .columns([Rows::PartitionKey, Rows::RowKey, Rows::Etag, Rows::Attrs])
                .from(Rows::Table);

            match &scan.partition {
                Partition::Key(pk) => {
                    select.and_where(Expr::col(Rows::PartitionKey).eq(pk.as_str()));
                }
                Partition::Prefix(prefix) => {
                    select.and_where(Expr::col(Rows::PartitionKey).like(like_prefix(prefix)));
                }
            }
            if let Some(from) = &scan.row_from {
                select.and_where(Expr::col(Rows::RowKey).gte(from));
            }
            if let Some(to) = &scan.row_to {
                select.and_where(Expr::col(Rows::RowKey).lt(to));
            }
            if let Some(token) = &scan.continuation {
                select.cond_where(
                    Cond::any()
                        .add(Expr::col(Rows::PartitionKey).gt(token.after_partition.as_str()))
                        .add(
                            Cond::all()
                                .add(Expr::col(Rows::PartitionKey).eq(token.after_partition.as_str()))
                                .add(Expr::col(Rows::RowKey).gt(token.after_row.as_str())),
                        ),
                );
            }

            select
                .order_by(Rows::PartitionKey, Order::Asc)
                .order_by(Rows::RowKey, Order::Asc)
                .limit(scan.page_size as u64)
                .to_string(SqliteQueryBuilder)
        };

        let fetched = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut rows = Vec::with_capacity(fetched.len());
        for row in fetched {
            let attrs: String = row.get("attrs");
            rows.push(TableRow {
                partition_key: row.get("partition_key"),
                row_key: row.get("row_key"),
                etag: row.get::<i64, _>("etag") as u64,
                attrs: serde_json::from_str(&attrs)?,
            });
        }

        let continuation = if rows.len() == scan.page_size {
            rows.last().map(|row| Continuation {
                after_partition: row.partition_key.clone(),
                after_row: row.row_key.clone(),
            })
        } else {
            None
        };

        Ok(Page { rows, continuation })
    }
}

/// SQLite implementation of the snapshot store.
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Create a new SQLite snapshot store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the schema.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(CREATE_SNAPSHOTS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, memento: Memento) -> snapshot_store::Result<()> {
        let insert = Query::insert()
            .into_table(Snapshots::Table)
            .columns([
                Snapshots::SourceId,
                Snapshots::Version,
                Snapshots::State,
                Snapshots::CreatedAt,
            ])
            .values_panic([
                memento.source_id.to_string().into(),
                (memento.version as i64).into(),
                memento.state.into(),
                chrono::Utc::now().to_rfc3339().into(),
            ])
            .on_conflict(
                OnConflict::column(Snapshots::SourceId)
                    .update_columns([Snapshots::Version, Snapshots::State, Snapshots::CreatedAt])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&insert).execute(&self.pool).await?;
        Ok(())
    }

    async fn find(&self, source_id: Uuid) -> snapshot_store::Result<Option<Memento>> {
        let query = Query::select()
            .columns([Snapshots::Version, Snapshots::State])
            .from(Snapshots::Table)
            .and_where(Expr::col(Snapshots::SourceId).eq(source_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|row| Memento {
            source_id,
            version: row.get::<i64, _>("version") as u64,
            state: row.get("state"),
        }))
    }

    async fn delete(&self, source_id: Uuid) -> snapshot_store::Result<()> {
        let delete = Query::delete()
            .from_table(Snapshots::Table)
            .and_where(Expr::col(Snapshots::SourceId).eq(source_id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&delete).execute(&self.pool).await?;
        Ok(())
    }
}

/// SQLite implementation of the unique-property index.
pub struct SqliteUniqueIndexStore {
    pool: SqlitePool,
}

impl SqliteUniqueIndexStore {
    /// Create a new SQLite unique index store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the schema.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(CREATE_UNIQUE_PROPERTIES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_changes(
        conn: &mut SqliteConnection,
        changes: &[PropertyChange],
    ) -> unique::Result<()> {
        for change in changes {
            match &change.value {
                Some(value) => {
                    // Uniqueness probe before the upsert so the
                    // violation carries the current owner.
                    let probe = Query::select()
                        .column(UniqueProperties::SourceId)
                        .from(UniqueProperties::Table)
                        .and_where(Expr::col(UniqueProperties::Kind).eq(change.kind.as_str()))
                        .and_where(Expr::col(UniqueProperties::Name).eq(change.name.as_str()))
                        .and_where(Expr::col(UniqueProperties::Value).eq(value.as_str()))
                        .to_string(SqliteQueryBuilder);
                    let row = sqlx::query(&probe).fetch_optional(&mut *conn).await?;
                    if let Some(row) = row {
                        let owner_str: String = row.get("source_id");
                        let owner = Uuid::parse_str(&owner_str).unwrap_or(Uuid::nil());
                        if owner != change.source_id {
                            return Err(UniqueIndexError::Violation {
                                kind: change.kind.clone(),
                                name: change.name.clone(),
                                value: value.clone(),
                                owner,
                            });
                        }
                    }

                    let upsert = Query::insert()
                        .into_table(UniqueProperties::Table)
                        .columns([
                            UniqueProperties::Kind,
                            UniqueProperties::Name,
                            UniqueProperties::Value,
                            UniqueProperties::SourceId,
                            UniqueProperties::Version,
                        ])
                        .values_panic([
                            change.kind.clone().into(),
                            change.name.clone().into(),
                            value.clone().into(),
                            change.source_id.to_string().into(),
                            (change.version as i64).into(),
                        ])
                        .on_conflict(
                            OnConflict::columns([
                                UniqueProperties::Kind,
                                UniqueProperties::Name,
                                UniqueProperties::SourceId,
                            ])
                            .update_columns([
                                UniqueProperties::Value,
                                UniqueProperties::Version,
                            ])
                            .to_owned(),
                        )
                        .to_string(SqliteQueryBuilder);
                    sqlx::query(&upsert).execute(&mut *conn).await?;
                }
                None => {
                    let delete = Query::delete()
                        .from_table(UniqueProperties::Table)
                        .and_where(Expr::col(UniqueProperties::Kind).eq(change.kind.as_str()))
                        .and_where(Expr::col(UniqueProperties::Name).eq(change.name.as_str()))
                        .and_where(
                            Expr::col(UniqueProperties::SourceId)
                                .eq(change.source_id.to_string()),
                        )
                        .to_string(SqliteQueryBuilder);
                    sqlx::query(&delete).execute(&mut *conn).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UniqueIndexStore for SqliteUniqueIndexStore {
    async fn apply(&self, changes: &[PropertyChange]) -> unique::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::apply_changes(&mut conn, changes).await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }
}
