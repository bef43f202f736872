//! Partition and row key encoding.
//!
//! These formats are bit-exact for interoperability with existing stored
//! data. Aggregate ids render as 32-digit lowercase hex with no dashes
//! (the uuid "simple" format).

use uuid::Uuid;

/// Partition-key prefix marking the pending namespace. A prefix scan over
/// it enumerates every aggregate with potentially-unpublished events.
pub const PENDING_PREFIX: &str = "PendingEvent-";

/// Row key of the aggregate identity row within the persistent partition.
/// Sorts apart from the zero-padded version keys and the `Correlation-`
/// rows.
pub const AGGREGATE_ROW_KEY: &str = "Aggregate";

/// Exclusive upper bound for version row keys: `:` is the first character
/// past `9` in ASCII, so the range `["0000000000", ":")` covers exactly
/// the zero-padded decimal keys.
pub const VERSION_ROW_KEY_UPPER: &str = ":";

/// Persistent partition key for an aggregate: `{kind}-{id:n}`.
pub fn aggregate_partition(kind: &str, source_id: Uuid) -> String {
    format!("{}-{}", kind, source_id.simple())
}

/// Pending partition key for an aggregate: `PendingEvent-{kind}-{id:n}`.
pub fn pending_partition(kind: &str, source_id: Uuid) -> String {
    format!("{}{}-{}", PENDING_PREFIX, kind, source_id.simple())
}

/// Row key for an event at a version: 10-digit zero-padded decimal.
pub fn version_row_key(version: u64) -> String {
    format!("{:010}", version)
}

/// Row key for a correlation record: `Correlation-{id:n}`.
pub fn correlation_row_key(correlation_id: Uuid) -> String {
    format!("Correlation-{}", correlation_id.simple())
}

/// Recover the persistent partition key from a pending partition key.
///
/// Returns `None` when the key is not in the pending namespace.
pub fn persistent_partition_of(pending_partition_key: &str) -> Option<&str> {
    pending_partition_key.strip_prefix(PENDING_PREFIX)
}
