//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building.

use sea_query::Iden;

/// Generic rows table schema: one table carries every partition.
#[derive(Iden)]
pub enum Rows {
    Table,
    #[iden = "partition_key"]
    PartitionKey,
    #[iden = "row_key"]
    RowKey,
    #[iden = "etag"]
    Etag,
    #[iden = "attrs"]
    Attrs,
}

/// Snapshots table schema.
#[derive(Iden)]
pub enum Snapshots {
    Table,
    #[iden = "source_id"]
    SourceId,
    #[iden = "version"]
    Version,
    #[iden = "state"]
    State,
    #[iden = "created_at"]
    CreatedAt,
}

/// Unique properties table schema.
#[derive(Iden)]
pub enum UniqueProperties {
    Table,
    #[iden = "kind"]
    Kind,
    #[iden = "name"]
    Name,
    #[iden = "value"]
    Value,
    #[iden = "source_id"]
    SourceId,
    #[iden = "version"]
    Version,
}

/// SQL for creating the rows table.
pub const CREATE_ROWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rows (
    partition_key TEXT NOT NULL,
    row_key TEXT NOT NULL,
    etag INTEGER NOT NULL,
    attrs TEXT NOT NULL,
    PRIMARY KEY (partition_key, row_key)
);
"#;

/// SQL for creating the snapshots table.
pub const CREATE_SNAPSHOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    source_id TEXT NOT NULL PRIMARY KEY,
    version INTEGER NOT NULL,
    state BLOB NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// SQL for creating the unique properties table.
pub const CREATE_UNIQUE_PROPERTIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS unique_properties (
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    source_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (kind, name, source_id),
    UNIQUE (kind, name, value)
);
"#;
