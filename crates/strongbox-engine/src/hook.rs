//! Store commit hook that writes the audit trail.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use strongbox_audit::AuditLedger;
use strongbox_core::{AuditAction, AuditEvent, AuditOutcome};
use strongbox_store::{CommitBatch, CommitHook, PendingWrite, StoreError, WriteKind};
use tracing::warn;

/// Records every write of a batch before it is persisted. If the ledger
/// refuses, the store aborts the batch.
pub struct AuditCommitHook {
    ledger: Arc<AuditLedger>,
}

impl AuditCommitHook {
    pub fn new(ledger: Arc<AuditLedger>) -> Self {
        Self { ledger }
    }

    fn action(write: &PendingWrite) -> AuditAction {
        match (&write.kind, write.secret) {
            (WriteKind::Delete, _) => AuditAction::ConfigDeleted {
                version: write.version,
            },
            (WriteKind::Rollback { target }, _) => AuditAction::ConfigRolledBack {
                target: *target,
                version: write.version,
            },
            (_, true) => AuditAction::SecretModified {
                version: write.version,
            },
            (WriteKind::Create, false) => AuditAction::ConfigCreated {
                version: write.version,
            },
            (WriteKind::Update, false) => AuditAction::ConfigUpdated {
                version: write.version,
                previous: write.previous,
            },
        }
    }

    fn event(batch: &CommitBatch, write: &PendingWrite, outcome: AuditOutcome) -> AuditEvent {
        let mut event = AuditEvent::new(batch.actor.clone(), write.key.resource(), Self::action(write), outcome)
            .with_tenant(write.key.tenant.clone());
        if let Some(tx) = &batch.transaction_id {
            event = event.with_details(json!({ "transaction_id": tx }));
        }
        event
    }
}

#[async_trait]
impl CommitHook for AuditCommitHook {
    async fn before_commit(&self, batch: &CommitBatch) -> Result<(), strongbox_core::Error> {
        if let (Some(tx), Some(first)) = (&batch.transaction_id, batch.writes.first()) {
            let event = AuditEvent::new(
                batch.actor.clone(),
                tx.clone(),
                AuditAction::TransactionCommitted {
                    writes: batch.writes.len(),
                },
                AuditOutcome::Success,
            )
            .with_tenant(first.key.tenant.clone());
            self.ledger.record(event).await?;
        }

        for write in &batch.writes {
            self.ledger
                .record(Self::event(batch, write, AuditOutcome::Success))
                .await?;
        }
        Ok(())
    }

    async fn commit_failed(&self, batch: &CommitBatch, error: &StoreError) {
        warn!(actor = %batch.actor, writes = batch.writes.len(), error = %error, "commit failed after audit");
        for write in &batch.writes {
            self.ledger
                .record_informational(Self::event(batch, write, AuditOutcome::Failure));
        }
    }
}
