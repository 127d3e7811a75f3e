pub mod memory;
pub mod models;
pub mod queries;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;
use uuid::Uuid;

use crate::audit::event::{AuditEvent, AuditLogEntry};
use crate::error::Result;
use models::{ChainCheckpoint, ChainLink, IntegrityHold};

pub use memory::MemoryStore;

/// Storage backend for the audit ledger.
///
/// The ledger is append-only: `insert_entry` is the only write to entries and
/// `delete_run_with_checkpoint` the only removal.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Hash of the most recently persisted entry, if any
    async fn last_hash(&self) -> Result<Option<String>>;

    async fn contains_event(&self, event_id: &Uuid) -> Result<bool>;

    async fn insert_entry(
        &self,
        event: &AuditEvent,
        previous_hash: &str,
        hash_chain: &str,
    ) -> Result<AuditLogEntry>;

    /// Entries for an actor with an event timestamp at or after `since`, in persistence order
    async fn actor_events_since(&self, actor_id: &str, since: DateTime<Utc>) -> Result<Vec<AuditLogEntry>>;

    /// Entries with an event timestamp in `[start, end]`, in persistence order
    async fn entries_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<AuditLogEntry>>;

    /// Entries persisted at or after `since`, in persistence order
    async fn entries_persisted_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditLogEntry>>;

    async fn all_entries(&self) -> Result<Vec<AuditLogEntry>>;

    /// Highest id among entries eligible for retention deletion
    async fn max_expired_id(&self, cutoff: DateTime<Utc>) -> Result<Option<i64>>;

    /// Up to `limit` chain links with id greater than `after_id`, ascending
    async fn chain_links(&self, after_id: i64, limit: i64) -> Result<Vec<ChainLink>>;

    /// Store `checkpoint` and delete the run `ids` it describes as one unit.
    ///
    /// Every id must still exist, be older than `cutoff` and carry risk below
    /// HIGH, and `checkpoint.previous_checkpoint_hash` must be the current
    /// checkpoint-chain head. Otherwise nothing changes and an error is
    /// returned. The checkpoint `id` is assigned by the store and returned.
    async fn delete_run_with_checkpoint(
        &self,
        checkpoint: &ChainCheckpoint,
        ids: &[i64],
        cutoff: DateTime<Utc>,
    ) -> Result<i64>;

    async fn checkpoints(&self) -> Result<Vec<ChainCheckpoint>>;

    async fn active_integrity_hold(&self) -> Result<Option<IntegrityHold>>;

    async fn set_integrity_hold(&self, reason: &str) -> Result<i64>;

    /// Clear every active hold, returning how many were cleared
    async fn clear_integrity_holds(&self, cleared_by: &str) -> Result<u64>;
}

/// SQLite-backed ledger store
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Database { pool })
    }

    /// Private in-memory database; a single connection keeps one shared schema
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // The schema file holds several statements, so it goes through the raw (unprepared) path
        sqlx::raw_sql(schema::AUDIT_LEDGER_SCHEMA)
            .execute(&self.pool)
            .await?;
        info!("Audit ledger schema applied ({} tables)", schema::LEDGER_TABLES.len());
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
