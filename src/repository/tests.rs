use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::*;
use crate::bus::MockMessageBus;
use crate::interfaces::JsonEventSerializer;
use crate::storage::{MemorySnapshotStore, MemoryTableStore};

const USER: AggregateKind = AggregateKind::new("User");

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct UserState {
    name: String,
    version: u64,
}

#[derive(Debug)]
struct TestUser {
    source_id: Uuid,
    state: UserState,
    uncommitted: Vec<DomainEvent>,
}

impl TestUser {
    fn create(source_id: Uuid, name: &str) -> Self {
        let mut user = Self {
            source_id,
            state: UserState::default(),
            uncommitted: Vec::new(),
        };
        user.raise("Created", serde_json::json!({ "name": name }));
        user
    }

    fn rename(&mut self, name: &str) {
        self.raise("NameChanged", serde_json::json!({ "name": name }));
    }

    fn raise(&mut self, event_type: &str, body: serde_json::Value) {
        let version = self.state.version + 1;
        let event = DomainEvent {
            source_id: self.source_id,
            version,
            event_type: event_type.to_string(),
            body,
            raised_at: Utc::now(),
            indexed: vec![],
        };
        self.apply(&event);
        self.uncommitted.push(event);
    }

    fn apply(&mut self, event: &DomainEvent) {
        if let Some(name) = event.body.get("name").and_then(|n| n.as_str()) {
            self.state.name = name.to_string();
        }
        self.state.version = event.version;
    }
}

impl Aggregate for TestUser {
    fn kind(&self) -> AggregateKind {
        USER
    }

    fn source_id(&self) -> Uuid {
        self.source_id
    }

    fn version(&self) -> u64 {
        self.state.version
    }

    fn take_uncommitted(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.uncommitted)
    }

    fn memento(&self) -> Option<Memento> {
        Some(Memento {
            source_id: self.source_id,
            version: self.state.version,
            state: serde_json::to_vec(&self.state).unwrap_or_default(),
        })
    }
}

/// What the rebuild function observed, for assertions.
#[derive(Clone, Debug, Default)]
struct RebuildStats {
    calls: usize,
    had_memento: bool,
    replayed: usize,
    name: String,
    version: u64,
}

fn user_registry(stats: Arc<Mutex<RebuildStats>>) -> RebuildRegistry {
    let mut registry = RebuildRegistry::new();
    registry.register(
        USER,
        Box::new(move |ctx: RebuildContext| {
            let state = match &ctx.memento {
                Some(memento) => serde_json::from_slice::<UserState>(&memento.state)
                    .map_err(|e| e.to_string())?,
                None => UserState::default(),
            };
            let mut user = TestUser {
                source_id: ctx.source_id,
                state,
                uncommitted: Vec::new(),
            };
            for event in &ctx.events {
                user.apply(event);
            }

            let mut s = stats.lock().unwrap();
            s.calls += 1;
            s.had_memento = ctx.memento.is_some();
            s.replayed = ctx.events.len();
            s.name = user.state.name.clone();
            s.version = user.state.version;
            drop(s);

            let aggregate: Box<dyn Aggregate> = Box::new(user);
            Ok(aggregate)
        }),
    );
    registry
}

struct Fixture {
    tables: Arc<MemoryTableStore>,
    bus: Arc<MockMessageBus>,
    snapshots: Arc<MemorySnapshotStore>,
    stats: Arc<Mutex<RebuildStats>>,
    repository: Repository,
}

fn fixture(with_snapshots: bool) -> Fixture {
    let tables = Arc::new(MemoryTableStore::new());
    let bus = Arc::new(MockMessageBus::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let stats = Arc::new(Mutex::new(RebuildStats::default()));

    let store = EventStore::new(tables.clone(), Arc::new(JsonEventSerializer));
    let publisher = EventPublisher::new(tables.clone(), bus.clone());
    let registry = user_registry(stats.clone());

    let repository = if with_snapshots {
        Repository::with_snapshots(store, publisher, registry, snapshots.clone())
    } else {
        Repository::new(store, publisher, registry)
    };

    Fixture {
        tables,
        bus,
        snapshots,
        stats,
        repository,
    }
}

#[tokio::test]
async fn test_save_then_find_roundtrip() {
    let f = fixture(false);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");
    user.rename("lovelace");

    f.repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap();

    // Save published the events.
    assert_eq!(f.bus.send_count().await, 1);

    let found = f.repository.find(USER, source_id).await.unwrap().unwrap();
    assert_eq!(found.version(), 2);
    let stats = f.stats.lock().unwrap().clone();
    assert_eq!(stats.name, "lovelace");
    assert_eq!(stats.replayed, 2);
    assert!(!stats.had_memento);
}

#[tokio::test]
async fn test_find_unknown_aggregate_is_none() {
    let f = fixture(false);
    let found = f.repository.find(USER, Uuid::new_v4()).await.unwrap();
    assert!(found.is_none());
    assert_eq!(f.stats.lock().unwrap().calls, 0);
}

#[tokio::test]
async fn test_find_unregistered_kind_fails() {
    let f = fixture(false);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");
    f.repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap();

    const GADGET: AggregateKind = AggregateKind::new("Gadget");
    // Write a Gadget event stream directly so resolution has something
    // to fail on.
    let store = EventStore::new(f.tables.clone(), Arc::new(JsonEventSerializer));
    let gadget_id = Uuid::new_v4();
    store
        .save_events(
            GADGET,
            &[DomainEvent {
                source_id: gadget_id,
                version: 1,
                event_type: "Made".to_string(),
                body: serde_json::json!({}),
                raised_at: Utc::now(),
                indexed: vec![],
            }],
            &SaveOptions::default(),
        )
        .await
        .unwrap();

    let err = f.repository.find(GADGET, gadget_id).await.unwrap_err();
    assert!(matches!(err, RepositoryError::UnregisteredKind(kind) if kind == "Gadget"));
}

#[tokio::test]
async fn test_save_failure_prevents_publication() {
    let f = fixture(false);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");
    // Corrupt the buffer into a gapped version run.
    user.uncommitted[0].version = 3;

    let err = f
        .repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Store(_)));
    assert_eq!(f.bus.send_count().await, 0);
}

#[tokio::test]
async fn test_publish_failure_prevents_snapshot() {
    let f = fixture(true);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");

    f.bus.set_fail_on_send(true).await;
    let err = f
        .repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Publish(_)));
    assert!(f.snapshots.find(source_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_repairs_crashed_publish() {
    let f = fixture(false);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");

    f.bus.set_fail_on_send(true).await;
    assert!(f
        .repository
        .save(&mut user, &SaveOptions::default())
        .await
        .is_err());

    // The events are durable but undelivered; find must deliver them
    // before reading.
    f.bus.set_fail_on_send(false).await;
    let found = f.repository.find(USER, source_id).await.unwrap().unwrap();
    assert_eq!(found.version(), 1);
    assert_eq!(f.bus.send_count().await, 1);
}

#[tokio::test]
async fn test_find_propagates_publish_failure_without_reading() {
    let f = fixture(false);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");

    f.bus.set_fail_on_send(true).await;
    assert!(f
        .repository
        .save(&mut user, &SaveOptions::default())
        .await
        .is_err());

    // Pending rows exist and the bus is still down: find fails and the
    // rebuild function is never consulted.
    let err = f.repository.find(USER, source_id).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Publish(_)));
    assert_eq!(f.stats.lock().unwrap().calls, 0);
}

#[tokio::test]
async fn test_snapshot_written_on_save_and_used_on_find() {
    let f = fixture(true);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");
    user.rename("lovelace");

    f.repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap();

    let memento = f.snapshots.find(source_id).await.unwrap().unwrap();
    assert_eq!(memento.version, 2);

    // All state comes from the memento; nothing is replayed.
    let found = f.repository.find(USER, source_id).await.unwrap().unwrap();
    assert_eq!(found.version(), 2);
    let stats = f.stats.lock().unwrap().clone();
    assert!(stats.had_memento);
    assert_eq!(stats.replayed, 0);
    assert_eq!(stats.name, "lovelace");
}

#[tokio::test]
async fn test_find_replays_events_past_memento() {
    let f = fixture(true);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");
    f.repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap();

    // Append a later event without refreshing the memento, as a
    // non-snapshotting writer would.
    let store = EventStore::new(f.tables.clone(), Arc::new(JsonEventSerializer));
    store
        .save_events(
            USER,
            &[DomainEvent {
                source_id,
                version: 2,
                event_type: "NameChanged".to_string(),
                body: serde_json::json!({ "name": "grace" }),
                raised_at: Utc::now(),
                indexed: vec![],
            }],
            &SaveOptions::default(),
        )
        .await
        .unwrap();

    let found = f.repository.find(USER, source_id).await.unwrap().unwrap();
    assert_eq!(found.version(), 2);
    let stats = f.stats.lock().unwrap().clone();
    assert!(stats.had_memento);
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.name, "grace");
}

#[tokio::test]
async fn test_save_with_no_buffered_events_is_quiet() {
    let f = fixture(false);
    let source_id = Uuid::new_v4();
    let mut user = TestUser::create(source_id, "ada");
    f.repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap();

    // Buffer already drained: a second save writes and publishes
    // nothing new.
    f.repository
        .save(&mut user, &SaveOptions::default())
        .await
        .unwrap();
    assert_eq!(f.bus.send_count().await, 1);
}
