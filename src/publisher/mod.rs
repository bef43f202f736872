//! Event publisher: reconciles pending rows against persistent rows and
//! delivers the matched ones.
//!
//! Only a pending event whose persistent counterpart exists is ever
//! published; a pending row orphaned by a crash between the two save
//! batches never became a real event and is skipped. Delivery is
//! at-least-once: a failed send leaves every pending row in place for the
//! next attempt, and consumers dedup on the envelope message id.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::envelope::{AggregateKind, EventEnvelope, PendingRecord};
use crate::interfaces::{BusError, MessageBus, RangeScan, TableError, TableStore};
use crate::keys;

/// Result type for publisher operations.
pub type Result<T> = std::result::Result<T, PublishError>;

/// Errors that can occur during publication.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// A pending row held attributes that do not decode as a pending
    /// record.
    #[error("Invalid pending record at partition={partition_key}, row={row_key}: {source}")]
    InvalidRecord {
        partition_key: String,
        row_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Publishes pending events whose persistent counterparts exist, then
/// removes the pending rows.
pub struct EventPublisher {
    tables: Arc<dyn TableStore>,
    bus: Arc<dyn MessageBus>,
}

impl EventPublisher {
    /// Create a publisher.
    pub fn new(tables: Arc<dyn TableStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { tables, bus }
    }

    /// Publish all matched pending events for one aggregate.
    ///
    /// Does not contact the bus when there is nothing to deliver. A bus
    /// failure propagates with every pending row intact; the caller owns
    /// retry policy.
    pub async fn publish_pending(&self, kind: AggregateKind, source_id: Uuid) -> Result<()> {
        let pending_pk = keys::pending_partition(kind.as_str(), source_id);
        let persistent_pk = keys::aggregate_partition(kind.as_str(), source_id);
        self.publish_partition(&pending_pk, &persistent_pk).await?;
        Ok(())
    }

    /// Publish matched pending events across every aggregate.
    ///
    /// Full prefix scan over the pending namespace, grouped per
    /// aggregate partition. Returns the number of aggregates that had
    /// events delivered. Used for periodic sweep/recovery, not
    /// per-request.
    pub async fn publish_all_pending(&self) -> Result<u32> {
        let mut published = 0u32;
        for pending_pk in self.pending_partitions().await? {
            let Some(persistent_pk) = keys::persistent_partition_of(&pending_pk) else {
                continue;
            };
            let persistent_pk = persistent_pk.to_string();
            if self.publish_partition(&pending_pk, &persistent_pk).await? {
                published += 1;
            }
        }
        if published > 0 {
            info!(aggregates = published, "Published pending events");
        }
        Ok(published)
    }

    /// Delete orphaned pending rows older than `grace`.
    ///
    /// An orphan is a pending row with no persistent counterpart: its
    /// save crashed between the pending and persistent batches, so the
    /// event never existed. The grace period must be generous enough
    /// that the in-flight save it might belong to has long since failed.
    /// Returns the number of rows removed.
    pub async fn sweep_orphans(&self, grace: Duration) -> Result<u32> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = 0u32;

        for pending_pk in self.pending_partitions().await? {
            let Some(persistent_pk) = keys::persistent_partition_of(&pending_pk) else {
                continue;
            };
            let persistent_pk = persistent_pk.to_string();

            let pending = self.load_pending(&pending_pk).await?;
            if pending.is_empty() {
                continue;
            }
            let lowest = pending.iter().map(|p| p.envelope.version).min().unwrap_or(0);
            let persisted = self.persisted_versions(&persistent_pk, lowest).await?;

            for record in pending {
                if persisted.contains(&record.envelope.version) {
                    continue;
                }
                if record.envelope.raised_at >= cutoff {
                    continue;
                }
                debug!(
                    partition = %pending_pk,
                    version = record.envelope.version,
                    "Sweeping orphaned pending row"
                );
                match self
                    .tables
                    .delete(&pending_pk, &keys::version_row_key(record.envelope.version))
                    .await
                {
                    Ok(()) => removed += 1,
                    Err(TableError::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if removed > 0 {
            info!(removed, "Swept orphaned pending rows");
        }
        Ok(removed)
    }

    /// Publish one pending partition. Returns whether anything was sent.
    async fn publish_partition(&self, pending_pk: &str, persistent_pk: &str) -> Result<bool> {
        let pending = self.load_pending(pending_pk).await?;
        if pending.is_empty() {
            return Ok(false);
        }

        let lowest = pending.iter().map(|p| p.envelope.version).min().unwrap_or(0);
        let persisted = self.persisted_versions(persistent_pk, lowest).await?;

        // Only pending rows with a durable counterpart are eligible;
        // orphans stay behind untouched.
        let mut eligible: Vec<PendingRecord> = pending
            .into_iter()
            .filter(|record| persisted.contains(&record.envelope.version))
            .collect();
        if eligible.is_empty() {
            return Ok(false);
        }
        eligible.sort_by_key(|record| record.envelope.version);

        let versions: Vec<u64> = eligible.iter().map(|r| r.envelope.version).collect();
        let messages: Vec<EventEnvelope> =
            eligible.iter().map(|record| record.envelope.clone()).collect();

        debug!(
            partition = %pending_pk,
            count = messages.len(),
            "Sending pending batch"
        );
        self.bus.send_batch(messages).await?;

        // Individual deletes: a row already removed by a concurrent
        // publisher is an expected race and is absorbed.
        for version in versions {
            match self
                .tables
                .delete(pending_pk, &keys::version_row_key(version))
                .await
            {
                Ok(()) => {}
                Err(TableError::NotFound { .. }) => {
                    debug!(
                        partition = %pending_pk,
                        version,
                        "Pending row already removed by concurrent publish"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    /// Load every pending record in a partition.
    async fn load_pending(&self, pending_pk: &str) -> Result<Vec<PendingRecord>> {
        let mut scan = RangeScan::partition(pending_pk.to_string());
        let mut records = Vec::new();
        loop {
            let page = self.tables.query(scan.clone()).await?;
            for row in page.rows {
                let record: PendingRecord =
                    serde_json::from_value(row.attrs).map_err(|source| {
                        PublishError::InvalidRecord {
                            partition_key: row.partition_key.clone(),
                            row_key: row.row_key.clone(),
                            source,
                        }
                    })?;
                records.push(record);
            }
            match page.continuation {
                Some(token) => scan = scan.after(token),
                None => break,
            }
        }
        Ok(records)
    }

    /// Versions with a persistent row, from `lowest` upward.
    async fn persisted_versions(
        &self,
        persistent_pk: &str,
        lowest: u64,
    ) -> Result<HashSet<u64>> {
        let mut scan = RangeScan::partition(persistent_pk.to_string()).rows(
            keys::version_row_key(lowest),
            keys::VERSION_ROW_KEY_UPPER,
        );
        let mut versions = HashSet::new();
        loop {
            let page = self.tables.query(scan.clone()).await?;
            for row in &page.rows {
                if let Ok(version) = row.row_key.parse::<u64>() {
                    versions.insert(version);
                }
            }
            match page.continuation {
                Some(token) => scan = scan.after(token),
                None => break,
            }
        }
        Ok(versions)
    }

    /// Distinct pending partition keys, via prefix scan.
    async fn pending_partitions(&self) -> Result<BTreeSet<String>> {
        let mut scan = RangeScan::prefix(keys::PENDING_PREFIX);
        let mut partitions = BTreeSet::new();
        loop {
            let page = self.tables.query(scan.clone()).await?;
            for row in &page.rows {
                partitions.insert(row.partition_key.clone());
            }
            match page.continuation {
                Some(token) => scan = scan.after(token),
                None => break,
            }
        }
        Ok(partitions)
    }
}

/// Handle to a running sweep task.
pub struct SweepTaskHandle {
    cancel: tokio::sync::watch::Sender<bool>,
}

impl SweepTaskHandle {
    /// Signal the sweep task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawn a background task that periodically sweeps orphaned pending
/// rows.
///
/// Returns a handle that can be used to stop the task.
pub fn spawn_sweep_task(
    publisher: Arc<EventPublisher>,
    interval: Duration,
    grace: Duration,
) -> SweepTaskHandle {
    let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = grace.as_secs(),
            "Orphan sweep task started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = publisher.sweep_orphans(grace).await {
                        error!(error = %e, "Orphan sweep failed");
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("Orphan sweep task stopped");
                        break;
                    }
                }
            }
        }
    });

    SweepTaskHandle { cancel: cancel_tx }
}
