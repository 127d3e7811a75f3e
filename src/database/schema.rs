// Database schema definitions
// The audit ledger schema, applied by `Database::run_migrations`

pub const AUDIT_LEDGER_SCHEMA: &str = include_str!("../../migrations/001_audit_ledger.sql");

pub const LEDGER_TABLES: &[&str] = &["audit_log", "audit_checkpoints", "audit_integrity_holds"];
