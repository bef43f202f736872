//! Event-sourced repository.
//!
//! Orchestrates the full write path (append, publish, snapshot) and the
//! full read path (repair-publish, snapshot load, replay) for aggregates
//! addressed by an explicit kind tag. Reconstruction goes through a
//! kind-to-rebuild-function registry resolved at call time; there is no
//! type-level dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::envelope::{AggregateKind, DomainEvent, Memento, SaveOptions};
use crate::interfaces::snapshot_store::SnapshotError;
use crate::interfaces::SnapshotStore;
use crate::publisher::{EventPublisher, PublishError};
use crate::store::{EventStore, StoreError};

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors that can occur during repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No rebuild function is registered for the kind.
    #[error("No rebuild function registered for kind {0}")]
    UnregisteredKind(String),

    /// A registered rebuild function rejected the replay data.
    #[error("Rebuild failed: {0}")]
    Rebuild(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// An event-sourced aggregate root.
pub trait Aggregate: std::fmt::Debug + Send + Sync {
    /// The aggregate's kind tag.
    fn kind(&self) -> AggregateKind;

    /// The aggregate's instance id.
    fn source_id(&self) -> Uuid;

    /// Current version (last applied event).
    fn version(&self) -> u64;

    /// Drain the buffered, not-yet-persisted events. Called once per
    /// save; the buffer is empty afterwards.
    fn take_uncommitted(&mut self) -> Vec<DomainEvent>;

    /// Capture current state as a memento, when the aggregate supports
    /// snapshotting. Default: no snapshot support.
    fn memento(&self) -> Option<Memento> {
        None
    }
}

/// Everything a rebuild function gets to work with.
pub struct RebuildContext {
    /// The aggregate instance id.
    pub source_id: Uuid,
    /// Snapshot to seed state from, when one was found.
    pub memento: Option<Memento>,
    /// Events to replay, ascending, starting past the memento's version
    /// (or from the beginning without one).
    pub events: Vec<DomainEvent>,
}

/// Rebuilds an aggregate from a replay context.
pub type RebuildFn =
    Box<dyn Fn(RebuildContext) -> std::result::Result<Box<dyn Aggregate>, String> + Send + Sync>;

/// Explicit kind-to-rebuild-function registry.
#[derive(Default)]
pub struct RebuildRegistry {
    rebuilders: HashMap<&'static str, RebuildFn>,
}

impl RebuildRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rebuild function for a kind, replacing any previous
    /// registration.
    pub fn register(&mut self, kind: AggregateKind, rebuild: RebuildFn) -> &mut Self {
        self.rebuilders.insert(kind.as_str(), rebuild);
        self
    }

    fn resolve(&self, kind: AggregateKind) -> Option<&RebuildFn> {
        self.rebuilders.get(kind.as_str())
    }
}

/// Repository coordinating store, publisher, and snapshot store.
pub struct Repository {
    store: EventStore,
    publisher: EventPublisher,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    registry: RebuildRegistry,
}

impl Repository {
    /// Create a repository without snapshot support.
    pub fn new(store: EventStore, publisher: EventPublisher, registry: RebuildRegistry) -> Self {
        Self {
            store,
            publisher,
            snapshots: None,
            registry,
        }
    }

    /// Create a repository with a snapshot store.
    pub fn with_snapshots(
        store: EventStore,
        publisher: EventPublisher,
        registry: RebuildRegistry,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            store,
            publisher,
            snapshots: Some(snapshots),
            registry,
        }
    }

    /// Persist and publish an aggregate's buffered events, then refresh
    /// its memento.
    ///
    /// Each stage runs only if the prior stage succeeded: a storage
    /// failure prevents publication, a publication failure prevents
    /// snapshotting.
    pub async fn save(&self, aggregate: &mut dyn Aggregate, opts: &SaveOptions) -> Result<()> {
        let kind = aggregate.kind();
        let source_id = aggregate.source_id();
        let events = aggregate.take_uncommitted();

        debug!(kind = %kind, source_id = %source_id, events = events.len(), "Saving aggregate");

        self.store.save_events(kind, &events, opts).await?;
        self.publisher.publish_pending(kind, source_id).await?;

        if let (Some(snapshots), Some(memento)) = (&self.snapshots, aggregate.memento()) {
            snapshots.save(memento).await?;
        }
        Ok(())
    }

    /// Load an aggregate, repairing any half-finished publish first.
    ///
    /// Returns `Ok(None)` when the aggregate has no events and no
    /// memento. A publish failure propagates before anything is read.
    pub async fn find(
        &self,
        kind: AggregateKind,
        source_id: Uuid,
    ) -> Result<Option<Box<dyn Aggregate>>> {
        self.publisher.publish_pending(kind, source_id).await?;

        let memento = match &self.snapshots {
            Some(snapshots) => snapshots.find(source_id).await?,
            None => None,
        };

        let after_version = memento.as_ref().map(|m| m.version).unwrap_or(0);
        let events = self.store.load_events(kind, source_id, after_version).await?;

        if events.is_empty() && memento.is_none() {
            return Ok(None);
        }

        let rebuild = self
            .registry
            .resolve(kind)
            .ok_or_else(|| RepositoryError::UnregisteredKind(kind.as_str().to_string()))?;

        let aggregate = rebuild(RebuildContext {
            source_id,
            memento,
            events,
        })
        .map_err(RepositoryError::Rebuild)?;
        Ok(Some(aggregate))
    }
}

#[cfg(test)]
mod tests;
