//! Sealed audit records and chain hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use strongbox_core::{ActorId, AuditAction, AuditEvent, AuditOutcome, AuditSeverity, TenantId};

/// `prev_hash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One sealed entry of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the ledger, starting at 1.
    pub sequence: u64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantId>,
    pub resource: String,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub severity: AuditSeverity,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,

    /// Hash of the preceding record.
    pub prev_hash: String,

    /// `SHA-256(prev_hash || canonical bytes)`, hex encoded.
    pub hash: String,
}

/// The hashed portion of a record. Field order is fixed.
#[derive(Serialize)]
struct Canonical<'a> {
    sequence: u64,
    id: &'a str,
    timestamp: &'a DateTime<Utc>,
    actor: &'a ActorId,
    tenant: &'a Option<TenantId>,
    resource: &'a str,
    action: &'a AuditAction,
    outcome: &'a AuditOutcome,
    severity: &'a AuditSeverity,
    details: &'a Value,
}

impl AuditRecord {
    /// Seal `event` as record `sequence`, chained to `prev_hash`.
    pub fn seal(event: AuditEvent, sequence: u64, timestamp: DateTime<Utc>, prev_hash: &str) -> Self {
        let severity = event.severity();
        let mut record = Self {
            sequence,
            id: strongbox_core::id::uuid(),
            timestamp,
            actor: event.actor,
            tenant: event.tenant,
            resource: event.resource,
            action: event.action,
            outcome: event.outcome,
            severity,
            details: event.details,
            prev_hash: prev_hash.to_string(),
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        record
    }

    /// Recompute the hash from the record's content and `prev_hash`.
    pub fn compute_hash(&self) -> String {
        let canonical = Canonical {
            sequence: self.sequence,
            id: &self.id,
            timestamp: &self.timestamp,
            actor: &self.actor,
            tenant: &self.tenant,
            resource: &self.resource,
            action: &self.action,
            outcome: &self.outcome,
            severity: &self.severity,
            details: &self.details,
        };
        // Serializing borrowed plain data cannot fail.
        let body = serde_json::to_vec(&canonical).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }

    /// Whether the stored hash matches the content.
    pub fn is_intact(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        let tenant = self
            .tenant
            .as_ref()
            .map(|t| format!("[{t}] "))
            .unwrap_or_default();
        format!(
            "#{} {tenant}{} {} on {}: {:?}",
            self.sequence, self.actor, self.action, self.resource, self.outcome
        )
    }
}

/// Check that `records` form an unbroken chain starting from the genesis hash.
pub fn verify_records(records: &[AuditRecord]) -> Result<(), (u64, String)> {
    let mut prev = GENESIS_HASH.to_string();
    let mut expected_sequence = 1;
    for record in records {
        if record.sequence != expected_sequence {
            return Err((
                record.sequence,
                format!("expected sequence {expected_sequence}"),
            ));
        }
        if record.prev_hash != prev {
            return Err((record.sequence, "prev_hash does not match preceding record".into()));
        }
        if !record.is_intact() {
            return Err((record.sequence, "content does not match hash".into()));
        }
        prev = record.hash.clone();
        expected_sequence += 1;
    }
    Ok(())
}
