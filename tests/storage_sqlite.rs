//! SQLite storage integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Uses an in-memory database by default, no external dependencies
//! required.

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use caisson::bus::MockMessageBus;
use caisson::envelope::{AggregateKind, DomainEvent, SaveOptions, UniqueProperty};
use caisson::interfaces::JsonEventSerializer;
use caisson::publisher::EventPublisher;
use caisson::storage::{SqliteTableStore, SqliteUniqueIndexStore};
use caisson::store::{EventStore, StoreError};

const USER: AggregateKind = AggregateKind::new("User");

/// Single connection so every handle sees the same in-memory database.
async fn pool() -> sqlx::SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to connect to SQLite")
}

fn event(source_id: Uuid, version: u64, event_type: &str) -> DomainEvent {
    DomainEvent {
        source_id,
        version,
        event_type: event_type.to_string(),
        body: serde_json::json!({ "v": version }),
        raised_at: Utc::now(),
        indexed: vec![],
    }
}

#[tokio::test]
async fn test_sqlite_save_publish_load_cycle() {
    let pool = pool().await;
    let tables = Arc::new(SqliteTableStore::new(pool));
    tables.init().await.unwrap();

    let bus = Arc::new(MockMessageBus::new());
    let store = EventStore::new(tables.clone(), Arc::new(JsonEventSerializer));
    let publisher = EventPublisher::new(tables.clone(), bus.clone());

    let id = Uuid::new_v4();
    store
        .save_events(
            USER,
            &[event(id, 1, "Created"), event(id, 2, "NameChanged")],
            &SaveOptions::correlated(Uuid::new_v4()),
        )
        .await
        .unwrap();

    publisher.publish_pending(USER, id).await.unwrap();
    let batches = bus.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);

    // Second publish finds nothing.
    publisher.publish_pending(USER, id).await.unwrap();
    assert_eq!(bus.send_count().await, 1);

    let loaded = store.load_events(USER, id, 0).await.unwrap();
    let versions: Vec<u64> = loaded.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_sqlite_version_conflict_surfaces() {
    let pool = pool().await;
    let tables = Arc::new(SqliteTableStore::new(pool));
    tables.init().await.unwrap();
    let store = EventStore::new(tables.clone(), Arc::new(JsonEventSerializer));

    let id = Uuid::new_v4();
    store
        .save_events(USER, &[event(id, 1, "Created")], &SaveOptions::default())
        .await
        .unwrap();

    let err = store
        .save_events(USER, &[event(id, 3, "Skipped")], &SaveOptions::default())
        .await
        .unwrap_err();
    match err {
        StoreError::Table(inner) => assert!(inner.is_conflict()),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sqlite_duplicate_correlation_detected() {
    let pool = pool().await;
    let tables = Arc::new(SqliteTableStore::new(pool));
    tables.init().await.unwrap();

    let bus = Arc::new(MockMessageBus::new());
    let store = EventStore::new(tables.clone(), Arc::new(JsonEventSerializer));
    let publisher = EventPublisher::new(tables.clone(), bus.clone());

    let id = Uuid::new_v4();
    let correlation = Uuid::new_v4();
    let events = [event(id, 1, "Created")];

    store
        .save_events(USER, &events, &SaveOptions::correlated(correlation))
        .await
        .unwrap();
    publisher.publish_pending(USER, id).await.unwrap();

    let err = store
        .save_events(USER, &events, &SaveOptions::correlated(correlation))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateCorrelation { .. }));
}

#[tokio::test]
async fn test_sqlite_unique_properties_enforced_through_store() {
    let pool = pool().await;
    let tables = Arc::new(SqliteTableStore::new(pool.clone()));
    tables.init().await.unwrap();
    let index = Arc::new(SqliteUniqueIndexStore::new(pool));
    index.init().await.unwrap();

    let store =
        EventStore::with_unique_index(tables, Arc::new(JsonEventSerializer), index);

    let ada = Uuid::new_v4();
    let mut created = event(ada, 1, "Created");
    created.indexed = vec![UniqueProperty {
        name: "username".to_string(),
        value: Some("ada".to_string()),
    }];
    store
        .save_events(USER, &[created], &SaveOptions::default())
        .await
        .unwrap();

    let grace = Uuid::new_v4();
    let mut clash = event(grace, 1, "Created");
    clash.indexed = vec![UniqueProperty {
        name: "username".to_string(),
        value: Some("ada".to_string()),
    }];
    let err = store
        .save_events(USER, &[clash], &SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UniqueIndex(_)));

    // The losing aggregate has no events.
    let loaded = store.load_events(USER, grace, 0).await.unwrap();
    assert!(loaded.is_empty());
}
