//! External collaborator interfaces.
//!
//! The protocol core is written against these traits; backends live under
//! `crate::storage` and `crate::bus`.

pub mod message_bus;
pub mod serializer;
pub mod snapshot_store;
pub mod table_store;

pub use message_bus::{BusError, MessageBus};
pub use serializer::{EventSerializer, JsonEventSerializer, SerializerError};
pub use snapshot_store::{SnapshotError, SnapshotStore};
pub use table_store::{
    BatchOp, Continuation, Page, Partition, RangeScan, TableBatch, TableError, TableRow, TableStore,
};
