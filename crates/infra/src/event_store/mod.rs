//! Append-only event store boundary.
//!
//! Defines the storage abstraction for aggregate event streams without
//! making backend assumptions; in-memory (dev/test) and Postgres
//! implementations live alongside.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
