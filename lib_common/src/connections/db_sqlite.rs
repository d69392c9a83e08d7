//! # SQLite Event Store
//!
//! Stores events in a single `events` table through a `sqlx` connection
//! pool. Timestamps are kept as RFC 3339 text so rows stay readable with the
//! stock `sqlite3` shell.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;

use super::event_store::{EventStore, StoreError};
use crate::models::{EventRecord, NewEvent};

const CREATE_EVENTS: &str = r#"
create table if not exists events (
    id integer primary key autoincrement,
    agent_id text not null,
    ts text not null,
    platform text not null,
    event_type text not null,
    cpu real,
    mem_free integer,
    pid integer,
    proc_name text,
    rss integer,
    ingested_at text not null
)
"#;

const CREATE_AGENT_INDEX: &str = "create index if not exists idx_events_agent on events (agent_id)";

const EVENT_COLUMNS: &str =
    "id, agent_id, ts, platform, event_type, cpu, mem_free, pid, proc_name, rss, ingested_at";

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    agent_id: String,
    ts: String,
    platform: String,
    event_type: String,
    cpu: Option<f64>,
    mem_free: Option<i64>,
    pid: Option<i64>,
    proc_name: Option<String>,
    rss: Option<i64>,
    ingested_at: String,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt { id: row.id, reason };
        let ts = DateTime::parse_from_rfc3339(&row.ts).map_err(|e| corrupt(format!("ts: {e}")))?;
        let ingested_at = DateTime::parse_from_rfc3339(&row.ingested_at)
            .map_err(|e| corrupt(format!("ingested_at: {e}")))?
            .with_timezone(&Utc);
        Ok(EventRecord {
            id: row.id,
            agent_id: row.agent_id,
            ts,
            platform: row.platform,
            event_type: row.event_type,
            cpu: row.cpu,
            mem_free: row.mem_free,
            pid: row.pid,
            proc_name: row.proc_name,
            rss: row.rss,
            ingested_at,
        })
    }
}

/// A pooled SQLite database holding telemetry events.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    /// The underlying sqlx connection pool.
    pub pool: SqlitePool,
}

impl SqliteEventStore {
    /// Opens (creating if needed) the database file at `path` and runs
    /// [`EventStore::init`].
    ///
    /// # Arguments
    /// * `path` - Location of the SQLite file.
    /// * `max_connections` - Maximum number of concurrent connections in the pool.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// A private in-memory database, used by tests and dry runs.
    ///
    /// Every SQLite connection to `:memory:` is its own database, so the pool
    /// is pinned to one connection that never expires.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Checks the health of the database connection by running a simple query.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_EVENTS).execute(&self.pool).await?;
        // Databases created before `rss` existed lack the column.
        if let Err(e) = sqlx::query("alter table events add column rss integer")
            .execute(&self.pool)
            .await
        {
            tracing::trace!("rss column already present: {}", e);
        }
        sqlx::query(CREATE_AGENT_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, rows: Vec<NewEvent>) -> Result<Vec<EventRecord>, StoreError> {
        let ingested_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let statement = format!(
            "insert into events (agent_id, ts, platform, event_type, cpu, mem_free, pid, proc_name, rss, ingested_at) \
             values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) returning {EVENT_COLUMNS}"
        );

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let stored: EventRow = sqlx::query_as(&statement)
                .bind(row.agent_id)
                .bind(row.ts.to_rfc3339())
                .bind(row.platform)
                .bind(row.event_type)
                .bind(row.cpu)
                .bind(row.mem_free)
                .bind(row.pid)
                .bind(row.proc_name)
                .bind(row.rss)
                .bind(ingested_at.clone())
                .fetch_one(&mut *tx)
                .await?;
            inserted.push(EventRecord::try_from(stored)?);
        }
        tx.commit().await?;

        tracing::debug!("stored {} events", inserted.len());
        Ok(inserted)
    }

    async fn fetch(&self, agent_id: Option<&str>, limit: u32) -> Result<Vec<EventRecord>, StoreError> {
        let statement = format!(
            "select {EVENT_COLUMNS} from events \
             where (?1 is null or agent_id = ?1) \
             order by ingested_at desc, id desc \
             limit ?2"
        );
        let rows: Vec<EventRow> = sqlx::query_as(&statement)
            .bind(agent_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn remove(&self, agent_id: Option<&str>) -> Result<u64, StoreError> {
        let result = match agent_id {
            Some(agent) => {
                sqlx::query("delete from events where agent_id = ?")
                    .bind(agent)
                    .execute(&self.pool)
                    .await?
            }
            None => sqlx::query("delete from events").execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }
}
