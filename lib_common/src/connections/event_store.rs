//! The storage contract for telemetry events.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{EventRecord, NewEvent};

/// Custom error types for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Row {id} could not be decoded: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Insert, fetch and delete of event rows.
///
/// `insert` returns the records exactly as stored. Those, and only those,
/// are what the relay broadcasts; a failed insert means nothing is
/// broadcast.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Prepares the schema. Safe to call more than once.
    async fn init(&self) -> Result<(), StoreError>;

    /// Persists every row atomically and returns the stored records in
    /// insertion order.
    async fn insert(&self, rows: Vec<NewEvent>) -> Result<Vec<EventRecord>, StoreError>;

    /// Newest records first, optionally for one agent, at most `limit`.
    async fn fetch(&self, agent_id: Option<&str>, limit: u32) -> Result<Vec<EventRecord>, StoreError>;

    /// Deletes all records, or those of one agent. Returns the number removed.
    async fn remove(&self, agent_id: Option<&str>) -> Result<u64, StoreError>;
}
