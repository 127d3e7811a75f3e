//! Hash Chain
//!
//! Each persisted entry's hash covers the previous entry's hash followed by
//! the canonical serialization of the entry itself.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::audit::event::{format_timestamp, AuditEvent};
use crate::database::models::ChainCheckpoint;
use crate::error::Result;

/// Previous hash used for the first entry of an empty ledger
pub const GENESIS_HASH: &str = "0";

/// Compute the chain hash for `event` following `previous_hash`
pub fn next_hash(previous_hash: &str, event: &AuditEvent) -> Result<String> {
    let canonical = event.canonical_string()?;
    Ok(digest(previous_hash, &canonical))
}

fn digest(previous_hash: &str, canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(canonical.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[derive(Serialize)]
struct CanonicalCheckpoint<'a> {
    anchor_hash: &'a str,
    resume_hash: &'a str,
    deleted_count: i64,
    first_deleted_id: i64,
    last_deleted_id: i64,
    created_at: String,
}

/// Compute the hash of `checkpoint` following `previous_checkpoint_hash`
pub fn checkpoint_hash(previous_checkpoint_hash: &str, checkpoint: &ChainCheckpoint) -> Result<String> {
    let canonical = serde_json::to_string(&CanonicalCheckpoint {
        anchor_hash: &checkpoint.anchor_hash,
        resume_hash: &checkpoint.resume_hash,
        deleted_count: checkpoint.deleted_count,
        first_deleted_id: checkpoint.first_deleted_id,
        last_deleted_id: checkpoint.last_deleted_id,
        created_at: format_timestamp(&checkpoint.created_at),
    })?;
    Ok(digest(previous_checkpoint_hash, &canonical))
}

/// In-process running hash.
///
/// Only valid when exactly one writer process owns the ledger: a second
/// instance holding its own `RunningHash` would fork the chain. The
/// persister does not use this; it re-reads the head from the datastore
/// under its drain lock.
#[derive(Debug, Clone)]
pub struct RunningHash {
    head: String,
}

impl RunningHash {
    pub fn new(head: impl Into<String>) -> Self {
        Self { head: head.into() }
    }

    pub fn genesis() -> Self {
        Self::new(GENESIS_HASH)
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    /// Chain `event` onto the head and return `(previous, new)` hashes
    pub fn advance(&mut self, event: &AuditEvent) -> Result<(String, String)> {
        let next = next_hash(&self.head, event)?;
        let previous = std::mem::replace(&mut self.head, next.clone());
        Ok((previous, next))
    }
}

impl Default for RunningHash {
    fn default() -> Self {
        Self::genesis()
    }
}
