use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::audit::chain::GENESIS_HASH;
use crate::audit::event::{format_timestamp, parse_timestamp, AuditEvent, AuditLogEntry};
use crate::database::models::{ChainCheckpoint, ChainLink, IntegrityHold};
use crate::database::{AuditStore, Database};
use crate::error::{AuditError, Result};

const ENTRY_COLUMNS: &str = "id, event_id, actor_id, actor_role, action, resource, resource_id, \
     patient_id, details, ip_address, user_agent, outcome, risk_level, reason, timestamp, \
     previous_hash, hash_chain, created_at";

fn entry_from_row(row: &SqliteRow) -> Result<AuditLogEntry> {
    let event_id: String = row.try_get("event_id")?;
    let event_id = Uuid::parse_str(&event_id)
        .map_err(|e| AuditError::SerializationError(format!("Invalid event id {}: {}", event_id, e)))?;
    let details: Option<String> = row.try_get("details")?;
    let details = details.map(|d| serde_json::from_str(&d)).transpose()?;
    let outcome: String = row.try_get("outcome")?;
    let risk_level: String = row.try_get("risk_level")?;
    let timestamp: String = row.try_get("timestamp")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(AuditLogEntry {
        id: row.try_get("id")?,
        event: AuditEvent {
            event_id,
            actor_id: row.try_get("actor_id")?,
            actor_role: row.try_get("actor_role")?,
            action: row.try_get("action")?,
            resource: row.try_get("resource")?,
            resource_id: row.try_get("resource_id")?,
            patient_id: row.try_get("patient_id")?,
            details,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            outcome: outcome.parse()?,
            risk_level: risk_level.parse()?,
            reason: row.try_get("reason")?,
            timestamp: parse_timestamp(&timestamp)?,
        },
        previous_hash: row.try_get("previous_hash")?,
        hash_chain: row.try_get("hash_chain")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn entries_from_rows(rows: Vec<SqliteRow>) -> Result<Vec<AuditLogEntry>> {
    rows.iter().map(entry_from_row).collect()
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<ChainCheckpoint> {
    let created_at: String = row.try_get("created_at")?;
    Ok(ChainCheckpoint {
        id: row.try_get("id")?,
        anchor_hash: row.try_get("anchor_hash")?,
        resume_hash: row.try_get("resume_hash")?,
        deleted_count: row.try_get("deleted_count")?,
        first_deleted_id: row.try_get("first_deleted_id")?,
        last_deleted_id: row.try_get("last_deleted_id")?,
        created_at: parse_timestamp(&created_at)?,
        previous_checkpoint_hash: row.try_get("previous_checkpoint_hash")?,
        checkpoint_hash: row.try_get("checkpoint_hash")?,
    })
}

fn now() -> String {
    format_timestamp(&Utc::now().trunc_subsecs(6))
}

#[async_trait]
impl AuditStore for Database {
    async fn last_hash(&self) -> Result<Option<String>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT hash_chain FROM audit_log ORDER BY id DESC LIMIT 1")
                .fetch_optional(self.pool())
                .await?;
        Ok(hash)
    }

    async fn contains_event(&self, event_id: &Uuid) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE event_id = ?")
            .bind(event_id.to_string())
            .fetch_one(self.pool())
            .await?;
        Ok(count > 0)
    }

    async fn insert_entry(
        &self,
        event: &AuditEvent,
        previous_hash: &str,
        hash_chain: &str,
    ) -> Result<AuditLogEntry> {
        let created_at = Utc::now().trunc_subsecs(6);
        let details = event.details.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (
                event_id, actor_id, actor_role, action, resource, resource_id, patient_id,
                details, ip_address, user_agent, outcome, risk_level, reason, timestamp,
                previous_hash, hash_chain, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(&event.actor_id)
        .bind(&event.actor_role)
        .bind(&event.action)
        .bind(&event.resource)
        .bind(&event.resource_id)
        .bind(&event.patient_id)
        .bind(details)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(event.outcome.as_str())
        .bind(event.risk_level.as_str())
        .bind(&event.reason)
        .bind(format_timestamp(&event.timestamp))
        .bind(previous_hash)
        .bind(hash_chain)
        .bind(format_timestamp(&created_at))
        .execute(self.pool())
        .await?;

        Ok(AuditLogEntry {
            id: result.last_insert_rowid(),
            event: event.clone(),
            previous_hash: previous_hash.to_string(),
            hash_chain: hash_chain.to_string(),
            created_at,
        })
    }

    async fn actor_events_since(&self, actor_id: &str, since: DateTime<Utc>) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_log WHERE actor_id = ? AND timestamp >= ? ORDER BY id ASC",
            ENTRY_COLUMNS
        ))
        .bind(actor_id)
        .bind(format_timestamp(&since))
        .fetch_all(self.pool())
        .await?;
        entries_from_rows(rows)
    }

    async fn entries_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_log WHERE timestamp >= ? AND timestamp <= ? ORDER BY id ASC",
            ENTRY_COLUMNS
        ))
        .bind(format_timestamp(&start))
        .bind(format_timestamp(&end))
        .fetch_all(self.pool())
        .await?;
        entries_from_rows(rows)
    }

    async fn entries_persisted_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_log WHERE created_at >= ? ORDER BY id ASC",
            ENTRY_COLUMNS
        ))
        .bind(format_timestamp(&since))
        .fetch_all(self.pool())
        .await?;
        entries_from_rows(rows)
    }

    async fn all_entries(&self) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query(&format!("SELECT {} FROM audit_log ORDER BY id ASC", ENTRY_COLUMNS))
            .fetch_all(self.pool())
            .await?;
        entries_from_rows(rows)
    }

    async fn max_expired_id(&self, cutoff: DateTime<Utc>) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(id) FROM audit_log WHERE timestamp < ? AND risk_level IN ('LOW', 'MEDIUM')",
        )
        .bind(format_timestamp(&cutoff))
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    async fn chain_links(&self, after_id: i64, limit: i64) -> Result<Vec<ChainLink>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, risk_level, previous_hash, hash_chain
            FROM audit_log
            WHERE id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let timestamp: String = row.try_get("timestamp")?;
                let risk_level: String = row.try_get("risk_level")?;
                Ok(ChainLink {
                    id: row.try_get("id")?,
                    timestamp: parse_timestamp(&timestamp)?,
                    risk_level: risk_level.parse()?,
                    previous_hash: row.try_get("previous_hash")?,
                    hash_chain: row.try_get("hash_chain")?,
                })
            })
            .collect()
    }

    async fn delete_run_with_checkpoint(
        &self,
        checkpoint: &ChainCheckpoint,
        ids: &[i64],
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        let cutoff = format_timestamp(&cutoff);

        // Dropping `tx` before commit rolls everything back, including on timeout
        let mut tx = self.pool().begin().await?;

        let head: Option<String> =
            sqlx::query_scalar("SELECT checkpoint_hash FROM audit_checkpoints ORDER BY id DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
        let head = head.unwrap_or_else(|| GENESIS_HASH.to_string());
        if head != checkpoint.previous_checkpoint_hash {
            return Err(AuditError::IntegrityError(format!(
                "checkpoint chain head is {}, checkpoint follows {}",
                head, checkpoint.previous_checkpoint_hash
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO audit_checkpoints (
                anchor_hash, resume_hash, deleted_count, first_deleted_id, last_deleted_id,
                created_at, previous_checkpoint_hash, checkpoint_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.anchor_hash)
        .bind(&checkpoint.resume_hash)
        .bind(checkpoint.deleted_count)
        .bind(checkpoint.first_deleted_id)
        .bind(checkpoint.last_deleted_id)
        .bind(format_timestamp(&checkpoint.created_at))
        .bind(&checkpoint.previous_checkpoint_hash)
        .bind(&checkpoint.checkpoint_hash)
        .execute(&mut *tx)
        .await?;
        let checkpoint_id = result.last_insert_rowid();

        for id in ids {
            let result = sqlx::query(
                "DELETE FROM audit_log WHERE id = ? AND timestamp < ? AND risk_level IN ('LOW', 'MEDIUM')",
            )
            .bind(id)
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                return Err(AuditError::IntegrityError(format!(
                    "entry {} is missing or no longer eligible for deletion",
                    id
                )));
            }
        }

        tx.commit().await?;
        Ok(checkpoint_id)
    }

    async fn checkpoints(&self) -> Result<Vec<ChainCheckpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT id, anchor_hash, resume_hash, deleted_count, first_deleted_id, last_deleted_id,
                   created_at, previous_checkpoint_hash, checkpoint_hash
            FROM audit_checkpoints
            ORDER BY id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn active_integrity_hold(&self) -> Result<Option<IntegrityHold>> {
        let row = sqlx::query(
            r#"
            SELECT id, reason, created_at
            FROM audit_integrity_holds
            WHERE cleared_at IS NULL
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            let created_at: String = row.try_get("created_at")?;
            Ok(IntegrityHold {
                id: row.try_get("id")?,
                reason: row.try_get("reason")?,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }

    async fn set_integrity_hold(&self, reason: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO audit_integrity_holds (reason, created_at) VALUES (?, ?)")
            .bind(reason)
            .bind(now())
            .execute(self.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn clear_integrity_holds(&self, cleared_by: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE audit_integrity_holds SET cleared_at = ?, cleared_by = ? WHERE cleared_at IS NULL",
        )
        .bind(now())
        .bind(cleared_by)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
