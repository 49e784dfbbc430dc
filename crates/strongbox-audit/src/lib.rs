//! # strongbox-audit
//!
//! Tamper-evident audit ledger for Strongbox.
//!
//! Records are sealed into a SHA-256 hash chain and appended to an
//! [`AuditSink`]. Mutations are recorded synchronously and fail closed; reads
//! go through a buffered path that never blocks the caller.

pub mod error;
pub mod filter;
pub mod ledger;
pub mod record;
pub mod sink;

pub use error::{AuditError, Result};
pub use filter::{AuditFilter, TimeRange};
pub use ledger::{AuditLedger, AuditStats, LedgerBuilder};
pub use record::{verify_records, AuditRecord, GENESIS_HASH};
pub use sink::{AuditSink, FileAuditSink, MemoryAuditSink};
