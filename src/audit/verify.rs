//! Audit Ledger Verification
//!
//! Recomputes the hash chain over persisted entries. Gaps left by retention
//! cleanup are accepted only where a checkpoint bridges them.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::audit::chain::{checkpoint_hash, next_hash, GENESIS_HASH};
use crate::audit::event::{actions, actors, AuditLogEntry};
use crate::database::models::ChainCheckpoint;

/// Details key under which a retention cleanup entry records the checkpoint-chain head
pub const CHECKPOINT_HEAD_KEY: &str = "checkpoint_head";

/// Verification result with detailed information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub entry_count: usize,
    pub hash_chain_valid: bool,
    pub bridged_gaps: usize,
    pub first_invalid_id: Option<i64>,
    #[serde(default)]
    pub invalid_checkpoint_id: Option<i64>,
    pub error_message: Option<String>,
}

impl VerificationResult {
    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        if self.is_valid {
            format!(
                "Audit ledger is valid ({} entries, {} retention gaps bridged)",
                self.entry_count, self.bridged_gaps
            )
        } else {
            format!(
                "Audit ledger is invalid ({} entries): {}",
                self.entry_count,
                self.error_message.as_deref().unwrap_or("Unknown error")
            )
        }
    }

    fn failed(entry_count: usize, bridged_gaps: usize, message: String) -> Self {
        warn!("Audit chain verification failed: {}", message);
        VerificationResult {
            is_valid: false,
            entry_count,
            hash_chain_valid: false,
            bridged_gaps,
            first_invalid_id: None,
            invalid_checkpoint_id: None,
            error_message: Some(message),
        }
    }
}

/// Retention checkpoints indexed by the hash pair they bridge
pub struct Bridges<'a> {
    by_hashes: HashMap<(&'a str, &'a str), Vec<&'a ChainCheckpoint>>,
}

impl<'a> Bridges<'a> {
    pub fn new(checkpoints: &'a [ChainCheckpoint]) -> Self {
        let mut by_hashes: HashMap<(&str, &str), Vec<&ChainCheckpoint>> = HashMap::new();
        for checkpoint in checkpoints {
            by_hashes
                .entry((checkpoint.anchor_hash.as_str(), checkpoint.resume_hash.as_str()))
                .or_default()
                .push(checkpoint);
        }
        Self { by_hashes }
    }

    /// Whether a checkpoint explains the break between the entry `before_id`
    /// (hash `anchor_hash`, id 0 for genesis) and the entry `after_id` whose
    /// stored previous hash is `resume_hash`
    pub fn covers(&self, before_id: i64, anchor_hash: &str, after_id: i64, resume_hash: &str) -> bool {
        self.by_hashes
            .get(&(anchor_hash, resume_hash))
            .map(|candidates| candidates.iter().any(|c| c.fits_between(before_id, after_id)))
            .unwrap_or(false)
    }
}

/// Verify the checkpoint chain, in id order, from genesis.
///
/// Returns the id of the first checkpoint that does not chain, with a message.
pub fn verify_checkpoint_chain(checkpoints: &[ChainCheckpoint]) -> Result<(), (i64, String)> {
    let mut expected_previous = GENESIS_HASH;
    for checkpoint in checkpoints {
        if checkpoint.previous_checkpoint_hash != expected_previous {
            return Err((
                checkpoint.id,
                format!(
                    "Checkpoint chain broken at checkpoint {}: expected previous {}, got {}",
                    checkpoint.id, expected_previous, checkpoint.previous_checkpoint_hash
                ),
            ));
        }
        match checkpoint_hash(&checkpoint.previous_checkpoint_hash, checkpoint) {
            Ok(hash) if hash == checkpoint.checkpoint_hash => {}
            Ok(_) => {
                return Err((
                    checkpoint.id,
                    format!("Checkpoint hash mismatch at checkpoint {}", checkpoint.id),
                ));
            }
            Err(e) => {
                return Err((
                    checkpoint.id,
                    format!("Checkpoint {} could not be serialized: {}", checkpoint.id, e),
                ));
            }
        }
        expected_previous = checkpoint.checkpoint_hash.as_str();
    }
    Ok(())
}

/// Checkpoint-chain head recorded by a retention cleanup entry, if any
fn sealed_checkpoint_head(entry: &AuditLogEntry) -> Option<&str> {
    if entry.event.action != actions::SYSTEM_RETENTION_CLEANUP || entry.event.actor_id != actors::SYSTEM {
        return None;
    }
    entry
        .event
        .details
        .as_ref()
        .and_then(|d| d.get(CHECKPOINT_HEAD_KEY))
        .and_then(|v| v.as_str())
}

/// Verify entries in persistence order.
///
/// With `from_genesis`, the first entry must chain from genesis (directly or
/// across a checkpoint); otherwise the window is assumed to start mid-ledger
/// and only the first entry's own hash is checked. The checkpoint chain is
/// always verified in full.
pub fn verify_chain(
    entries: &[AuditLogEntry],
    checkpoints: &[ChainCheckpoint],
    from_genesis: bool,
) -> VerificationResult {
    if let Err((checkpoint_id, message)) = verify_checkpoint_chain(checkpoints) {
        let mut result = VerificationResult::failed(entries.len(), 0, message);
        result.invalid_checkpoint_id = Some(checkpoint_id);
        return result;
    }

    let bridges = Bridges::new(checkpoints);
    let checkpoint_hashes: HashSet<&str> = checkpoints.iter().map(|c| c.checkpoint_hash.as_str()).collect();
    let mut bridged_gaps = 0;

    let fail = |entry: &AuditLogEntry, message: String, bridged_gaps: usize| {
        let mut result = VerificationResult::failed(entries.len(), bridged_gaps, message);
        result.first_invalid_id = Some(entry.id);
        result
    };

    let mut previous: Option<&AuditLogEntry> = None;
    for entry in entries {
        match next_hash(&entry.previous_hash, &entry.event) {
            Ok(expected) if expected == entry.hash_chain => {}
            Ok(_) => {
                return fail(entry, format!("Hash mismatch at entry {}", entry.id), bridged_gaps);
            }
            Err(e) => {
                return fail(
                    entry,
                    format!("Entry {} could not be serialized: {}", entry.id, e),
                    bridged_gaps,
                );
            }
        }

        let expected_previous = match previous {
            Some(prev) => Some((prev.id, prev.hash_chain.as_str())),
            None if from_genesis => Some((0, GENESIS_HASH)),
            None => None,
        };

        if let Some((before_id, expected_previous)) = expected_previous {
            if entry.previous_hash != expected_previous {
                if bridges.covers(before_id, expected_previous, entry.id, &entry.previous_hash) {
                    debug!("Entry {} follows a retention checkpoint", entry.id);
                    bridged_gaps += 1;
                } else {
                    return fail(
                        entry,
                        format!(
                            "Hash chain broken at entry {}: expected previous {}, got {}",
                            entry.id, expected_previous, entry.previous_hash
                        ),
                        bridged_gaps,
                    );
                }
            }
        }

        if let Some(head) = sealed_checkpoint_head(entry) {
            if head != GENESIS_HASH && !checkpoint_hashes.contains(head) {
                return fail(
                    entry,
                    format!(
                        "Entry {} seals checkpoint {} which is missing from the checkpoint chain",
                        entry.id, head
                    ),
                    bridged_gaps,
                );
            }
        }

        previous = Some(entry);
    }

    info!("Audit chain verification successful: {} entries", entries.len());
    VerificationResult {
        is_valid: true,
        entry_count: entries.len(),
        hash_chain_valid: true,
        bridged_gaps,
        first_invalid_id: None,
        invalid_checkpoint_id: None,
        error_message: None,
    }
}

/// Find entries whose stored hash does not match their own payload
pub fn find_tampered_entries(entries: &[AuditLogEntry]) -> Vec<i64> {
    entries
        .iter()
        .filter(|entry| {
            next_hash(&entry.previous_hash, &entry.event)
                .map(|expected| expected != entry.hash_chain)
                .unwrap_or(true)
        })
        .map(|entry| entry.id)
        .collect()
}

/// Information about a break between adjacent entries
#[derive(Debug, Clone, PartialEq)]
pub struct GapInfo {
    pub before_id: i64,
    pub after_id: i64,
    pub gap_type: GapType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GapType {
    /// Removed by retention and bridged by a checkpoint
    Retention,
    /// Unexplained discontinuity
    HashGap,
}

/// Detect discontinuities between adjacent entries
pub fn detect_gaps(entries: &[AuditLogEntry], checkpoints: &[ChainCheckpoint]) -> Vec<GapInfo> {
    let bridges = Bridges::new(checkpoints);

    entries
        .windows(2)
        .filter(|pair| pair[1].previous_hash != pair[0].hash_chain)
        .map(|pair| GapInfo {
            before_id: pair[0].id,
            after_id: pair[1].id,
            gap_type: if bridges.covers(pair[0].id, &pair[0].hash_chain, pair[1].id, &pair[1].previous_hash) {
                GapType::Retention
            } else {
                GapType::HashGap
            },
        })
        .collect()
}
