use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::event::RiskLevel;

/// Hash-chain view of a ledger row, without the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub risk_level: RiskLevel,
    pub previous_hash: String,
    pub hash_chain: String,
}

/// Records that the entries between `anchor_hash` and `resume_hash` were
/// removed by retention cleanup. `anchor_hash` is the hash of the last
/// surviving entry before the run (or genesis); `resume_hash` is the
/// previous-hash of the first surviving entry after it.
///
/// Checkpoints form their own hash chain in id order: `checkpoint_hash`
/// covers `previous_checkpoint_hash` and every other field except `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    pub id: i64,
    pub anchor_hash: String,
    pub resume_hash: String,
    pub deleted_count: i64,
    pub first_deleted_id: i64,
    pub last_deleted_id: i64,
    pub created_at: DateTime<Utc>,
    pub previous_checkpoint_hash: String,
    pub checkpoint_hash: String,
}

impl ChainCheckpoint {
    /// Whether this checkpoint can stand for the entries strictly between
    /// ledger ids `before_id` and `after_id`
    pub fn fits_between(&self, before_id: i64, after_id: i64) -> bool {
        let span = self.last_deleted_id - self.first_deleted_id + 1;
        before_id < self.first_deleted_id
            && self.first_deleted_id <= self.last_deleted_id
            && self.last_deleted_id < after_id
            && self.deleted_count >= 1
            && self.deleted_count <= span
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityHold {
    pub id: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
