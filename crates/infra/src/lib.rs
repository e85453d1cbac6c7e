//! Infrastructure layer: event storage, command dispatch, read models and
//! external-service adapters (payment gateway, stock platform, mail).

pub mod audit;
pub mod command_dispatcher;
pub mod event_store;
pub mod gateway;
pub mod mailer;
pub mod projections;
pub mod read_model;
pub mod stock_api;

pub use audit::{ActivityEntry, ActivityLog, InMemoryActivityLog};
pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore, StoredEvent,
    UncommittedEvent,
};
pub use read_model::{InMemoryKeyedStore, KeyedStore};
