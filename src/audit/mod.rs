//! Audit Ledger
//!
//! Tamper-evident recording of sensitive actions: events are classified and
//! queued without blocking the caller, then chained with SHA-256 and
//! persisted by a single background drain worker.

pub mod chain;
pub mod detector;
pub mod event;
pub mod persister;
pub mod queue;
pub mod risk;
pub mod verify;
pub mod worker;

pub use chain::{next_hash, GENESIS_HASH};
pub use event::{AuditEvent, AuditLogEntry, NewAuditEvent, Outcome, RiskLevel};
pub use queue::EventQueue;
pub use risk::classify_risk;
pub use verify::{detect_gaps, find_tampered_entries, verify_chain, GapInfo, GapType, VerificationResult};
