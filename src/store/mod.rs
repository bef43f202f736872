//! Event store: durable append with pending/persistent reconciliation.
//!
//! A save writes each batch of events twice: first into the aggregate's
//! pending partition, then into its persistent partition together with
//! the identity-row version check and the optional correlation row. The
//! two batches are independent atomic units; a crash between them leaves
//! orphan pending rows that the publisher skips and the sweep eventually
//! removes. Writing pending first makes the inverse orphan (persistent
//! without pending) impossible by construction.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::envelope::{
    AggregateKind, CorrelationRecord, DomainEvent, EventEnvelope, IdentityRecord, PendingRecord,
    SaveOptions,
};
use crate::interfaces::serializer::SerializerError;
use crate::interfaces::{EventSerializer, RangeScan, TableBatch, TableError, TableRow, TableStore};
use crate::keys;

pub mod unique;

pub use unique::{PropertyChange, UniqueIndexError, UniqueIndexStore};

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during event store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `events` contained an event with a nil source id.
    #[error("events: source id must not be nil")]
    NilSourceId,

    /// `events` mixed more than one source id.
    #[error("events: all events must share one source id: expected {expected}, event at version {version} has {actual}")]
    MismatchedSourceId {
        expected: Uuid,
        actual: Uuid,
        version: u64,
    },

    /// `events` versions were not a contiguous ascending run.
    #[error("events: versions must ascend contiguously: expected {expected}, got {actual}")]
    NonContiguousVersions { expected: u64, actual: u64 },

    /// `events` began at version 0; the first event of any aggregate is
    /// version 1.
    #[error("events: versions start at 1")]
    ZeroVersion,

    /// The supplied correlation id has already been used against this
    /// aggregate: the causal request was already processed and the save
    /// is safe to treat as done.
    #[error("Duplicate correlation id {correlation_id} for {kind}-{source_id}")]
    DuplicateCorrelation {
        kind: String,
        source_id: Uuid,
        correlation_id: Uuid,
        #[source]
        source: TableError,
    },

    #[error(transparent)]
    Serializer(#[from] SerializerError),

    #[error(transparent)]
    UniqueIndex(#[from] UniqueIndexError),

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Event store over a partitioned table backend.
pub struct EventStore {
    tables: Arc<dyn TableStore>,
    serializer: Arc<dyn EventSerializer>,
    unique_index: Option<Arc<dyn UniqueIndexStore>>,
}

impl EventStore {
    /// Create an event store without unique-property indexing.
    pub fn new(tables: Arc<dyn TableStore>, serializer: Arc<dyn EventSerializer>) -> Self {
        Self {
            tables,
            serializer,
            unique_index: None,
        }
    }

    /// Create an event store with a unique-property index collaborator.
    pub fn with_unique_index(
        tables: Arc<dyn TableStore>,
        serializer: Arc<dyn EventSerializer>,
        unique_index: Arc<dyn UniqueIndexStore>,
    ) -> Self {
        Self {
            tables,
            serializer,
            unique_index: Some(unique_index),
        }
    }

    /// Append events for an aggregate.
    ///
    /// The first event's version must be exactly one past the identity
    /// row's current version; a losing concurrent writer gets the
    /// backend's conflict error, reclassified as
    /// [`StoreError::DuplicateCorrelation`] when the correlation probe
    /// finds the supplied token already recorded.
    ///
    /// An empty `events` slice performs no I/O and succeeds.
    ///
    /// Dropping the returned future between the pending and persistent
    /// batches leaves orphan pending rows; they are never published and
    /// the sweep removes them after the grace period.
    pub async fn save_events(
        &self,
        kind: AggregateKind,
        events: &[DomainEvent],
        opts: &SaveOptions,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let source_id = validate(events)?;
        let first_version = events[0].version;
        let last_version = events[events.len() - 1].version;

        debug!(
            kind = %kind,
            source_id = %source_id,
            first_version,
            last_version,
            "Appending events"
        );

        // Unique property changes go first so a conflicting value fails
        // the save before any event row commits.
        if let Some(index) = &self.unique_index {
            let changes = unique::collect_changes(kind, events);
            if !changes.is_empty() {
                index.apply(&changes).await?;
            }
        }

        let envelopes = self.wrap(kind, events, opts)?;

        let persistent_pk = keys::aggregate_partition(kind.as_str(), source_id);
        let pending_pk = keys::pending_partition(kind.as_str(), source_id);

        // Batch 1: pending copies. A duplicate (aggregate, version) here
        // is a concurrent writer racing on the same versions; the
        // backend's conflict surfaces unchanged.
        let mut pending = TableBatch::new(pending_pk.clone());
        for envelope in &envelopes {
            pending.insert(pending_row(&pending_pk, &persistent_pk, envelope)?);
        }
        self.tables.execute(pending).await?;

        // Batch 2: persistent copies + identity version check +
        // correlation row.
        let mut persistent = TableBatch::new(persistent_pk.clone());
        for envelope in &envelopes {
            persistent.insert(persistent_row(&persistent_pk, envelope)?);
        }
        let identity = identity_row(&persistent_pk, kind, source_id, last_version)?;
        if first_version == 1 {
            persistent.insert(identity);
        } else {
            persistent.update(identity, first_version - 1);
        }
        if let Some(correlation_id) = opts.correlation_id {
            persistent.insert(correlation_row(&persistent_pk, correlation_id)?);
        }

        match self.tables.execute(persistent).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Attempt/probe/branch: a conflict plus an existing
                // correlation row means this causal request was already
                // processed; anything else is a genuine version race.
                if let Some(correlation_id) = opts.correlation_id {
                    let probe = self
                        .tables
                        .get(&persistent_pk, &keys::correlation_row_key(correlation_id))
                        .await?;
                    if probe.is_some() {
                        debug!(
                            kind = %kind,
                            source_id = %source_id,
                            correlation_id = %correlation_id,
                            "Correlation row already present, reclassifying conflict"
                        );
                        return Err(StoreError::DuplicateCorrelation {
                            kind: kind.as_str().to_string(),
                            source_id,
                            correlation_id,
                            source: err,
                        });
                    }
                }
                Err(StoreError::Table(err))
            }
        }
    }

    /// Load events for an aggregate with version > `after_version`,
    /// ascending. Unknown aggregates yield an empty vec.
    pub async fn load_events(
        &self,
        kind: AggregateKind,
        source_id: Uuid,
        after_version: u64,
    ) -> Result<Vec<DomainEvent>> {
        let partition = keys::aggregate_partition(kind.as_str(), source_id);
        let mut scan = RangeScan::partition(partition).rows(
            keys::version_row_key(after_version + 1),
            keys::VERSION_ROW_KEY_UPPER,
        );

        let mut events = Vec::new();
        loop {
            let page = self.tables.query(scan.clone()).await?;
            for row in page.rows {
                let envelope: EventEnvelope =
                    serde_json::from_value(row.attrs).map_err(TableError::Attributes)?;
                events.push(self.serializer.deserialize(&envelope.payload)?);
            }
            match page.continuation {
                Some(token) => scan = scan.after(token),
                None => break,
            }
        }
        Ok(events)
    }

    fn wrap(
        &self,
        kind: AggregateKind,
        events: &[DomainEvent],
        opts: &SaveOptions,
    ) -> Result<Vec<EventEnvelope>> {
        events
            .iter()
            .map(|event| {
                Ok(EventEnvelope {
                    message_id: Uuid::new_v4(),
                    kind: kind.as_str().to_string(),
                    source_id: event.source_id,
                    version: event.version,
                    event_type: event.event_type.clone(),
                    payload: self.serializer.serialize(event)?,
                    operation_id: opts.operation_id,
                    correlation_id: opts.correlation_id,
                    contributor: opts.contributor.clone(),
                    raised_at: event.raised_at,
                })
            })
            .collect()
    }
}

/// Validate the batch shape and return the shared source id.
fn validate(events: &[DomainEvent]) -> Result<Uuid> {
    let source_id = events[0].source_id;
    if source_id.is_nil() {
        return Err(StoreError::NilSourceId);
    }
    if events[0].version == 0 {
        return Err(StoreError::ZeroVersion);
    }

    let mut expected = events[0].version;
    for event in events {
        if event.source_id != source_id {
            return Err(StoreError::MismatchedSourceId {
                expected: source_id,
                actual: event.source_id,
                version: event.version,
            });
        }
        if event.version != expected {
            return Err(StoreError::NonContiguousVersions {
                expected,
                actual: event.version,
            });
        }
        expected += 1;
    }
    Ok(source_id)
}

fn persistent_row(partition_key: &str, envelope: &EventEnvelope) -> Result<TableRow> {
    Ok(TableRow {
        partition_key: partition_key.to_string(),
        row_key: keys::version_row_key(envelope.version),
        etag: envelope.version,
        attrs: serde_json::to_value(envelope).map_err(TableError::Attributes)?,
    })
}

fn pending_row(
    partition_key: &str,
    persistent_partition_key: &str,
    envelope: &EventEnvelope,
) -> Result<TableRow> {
    let record = PendingRecord {
        envelope: envelope.clone(),
        persistent_partition_key: persistent_partition_key.to_string(),
        persistent_row_key: keys::version_row_key(envelope.version),
    };
    Ok(TableRow {
        partition_key: partition_key.to_string(),
        row_key: keys::version_row_key(envelope.version),
        etag: envelope.version,
        attrs: serde_json::to_value(&record).map_err(TableError::Attributes)?,
    })
}

fn identity_row(
    partition_key: &str,
    kind: AggregateKind,
    source_id: Uuid,
    version: u64,
) -> Result<TableRow> {
    let record = IdentityRecord {
        kind: kind.as_str().to_string(),
        source_id,
        version,
    };
    Ok(TableRow {
        partition_key: partition_key.to_string(),
        row_key: keys::AGGREGATE_ROW_KEY.to_string(),
        etag: version,
        attrs: serde_json::to_value(&record).map_err(TableError::Attributes)?,
    })
}

fn correlation_row(partition_key: &str, correlation_id: Uuid) -> Result<TableRow> {
    let record = CorrelationRecord { correlation_id };
    Ok(TableRow {
        partition_key: partition_key.to_string(),
        row_key: keys::correlation_row_key(correlation_id),
        etag: 0,
        attrs: serde_json::to_value(&record).map_err(TableError::Attributes)?,
    })
}
