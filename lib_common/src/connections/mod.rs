//! # Connections Module
//!
//! Persistence for accepted telemetry. Handlers only talk to the
//! [`EventStore`] trait; the relay wires in the SQLite implementation.

/// The storage contract used by the ingest path.
pub mod event_store;

/// SQLite-backed event storage built on `sqlx`.
pub mod db_sqlite;

pub use db_sqlite::SqliteEventStore;
pub use event_store::{EventStore, StoreError};
