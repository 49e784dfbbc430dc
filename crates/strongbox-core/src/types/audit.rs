//! Audit vocabulary shared by every component that emits audit events.

use super::identifiers::{ActorId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An auditable event, before it is sealed into the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Who performed the action.
    pub actor: ActorId,

    /// Owning tenant, if the resource is tenant-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantId>,

    /// Resource identifier (never a value).
    pub resource: String,

    /// What happened.
    pub action: AuditAction,

    /// How it ended.
    pub outcome: AuditOutcome,

    /// Additional details. Must not carry secret material.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(
        actor: ActorId,
        resource: impl Into<String>,
        action: AuditAction,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            actor,
            tenant: None,
            resource: resource.into(),
            action,
            outcome,
            details: Value::Null,
        }
    }

    /// Set the owning tenant.
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Set details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Severity derived from action and outcome.
    pub fn severity(&self) -> AuditSeverity {
        let base = self.action.severity();
        match self.outcome {
            AuditOutcome::Success => base,
            AuditOutcome::Denied | AuditOutcome::Timeout => base.max(AuditSeverity::Warning),
            AuditOutcome::Failure => base.max(AuditSeverity::Error),
        }
    }

    /// Whether the event mutates secret or access state, and therefore must be
    /// written synchronously.
    pub fn is_mutating(&self) -> bool {
        self.action.is_mutating()
    }
}

/// Type of audited action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAction {
    // Configuration events
    /// New key created (first version).
    ConfigCreated { version: u64 },

    /// New version written to an existing key.
    ConfigUpdated {
        version: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<u64>,
    },

    /// Tombstone written.
    ConfigDeleted { version: u64 },

    /// Value read.
    ConfigAccessed {
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },

    /// Rolled back to an earlier version.
    ConfigRolledBack { target: u64, version: u64 },

    /// Multi-key transaction committed.
    TransactionCommitted { writes: usize },

    /// Live entries written out to an export directory.
    ConfigExported { entries: usize },

    // Secret events
    /// Secret value written.
    SecretModified { version: u64 },

    /// Secret value decrypted for a caller.
    SecretAccessed { version: u64 },

    /// Presented credential checked.
    SecretVerified { matched: String },

    // Access events
    /// Authorization collaborator consulted.
    AuthorizationCheck { operation: String, allowed: bool },

    // Rotation events
    /// Rotation job scheduled.
    RotationScheduled { job_id: String, trigger: String },

    /// Rotation job changed state.
    RotationTransition {
        job_id: String,
        from: String,
        to: String,
    },

    /// Rotation job cancelled.
    RotationCancelled { job_id: String },

    /// Rotation job rolled back.
    RotationRolledBack { job_id: String, reason: String },

    // Tenant events
    /// Tenant provisioned.
    TenantProvisioned,

    /// Tenant quotas or status changed.
    TenantUpdated,

    /// Tenant deleted after key destruction.
    TenantDeleted,

    // System events
    /// Retention removed old versions.
    RetentionApplied { removed: usize },

    /// Persisted state failed an integrity check.
    IntegrityViolation { reason: String },

    /// Generic security-relevant event.
    SecurityEvent { description: String },
}

impl AuditAction {
    /// Short machine-readable name, used in filters.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigCreated { .. } => "config_created",
            Self::ConfigUpdated { .. } => "config_updated",
            Self::ConfigDeleted { .. } => "config_deleted",
            Self::ConfigAccessed { .. } => "config_accessed",
            Self::ConfigRolledBack { .. } => "config_rolled_back",
            Self::TransactionCommitted { .. } => "transaction_committed",
            Self::ConfigExported { .. } => "config_exported",
            Self::SecretModified { .. } => "secret_modified",
            Self::SecretAccessed { .. } => "secret_accessed",
            Self::SecretVerified { .. } => "secret_verified",
            Self::AuthorizationCheck { .. } => "authorization_check",
            Self::RotationScheduled { .. } => "rotation_scheduled",
            Self::RotationTransition { .. } => "rotation_transition",
            Self::RotationCancelled { .. } => "rotation_cancelled",
            Self::RotationRolledBack { .. } => "rotation_rolled_back",
            Self::TenantProvisioned => "tenant_provisioned",
            Self::TenantUpdated => "tenant_updated",
            Self::TenantDeleted => "tenant_deleted",
            Self::RetentionApplied { .. } => "retention_applied",
            Self::IntegrityViolation { .. } => "integrity_violation",
            Self::SecurityEvent { .. } => "security_event",
        }
    }

    /// Baseline severity for a successful action.
    pub fn severity(&self) -> AuditSeverity {
        match self {
            Self::ConfigAccessed { .. } | Self::SecretVerified { .. } => AuditSeverity::Debug,
            Self::AuthorizationCheck { allowed: true, .. } => AuditSeverity::Debug,
            Self::AuthorizationCheck { allowed: false, .. } => AuditSeverity::Warning,
            Self::SecretAccessed { .. } | Self::SecretModified { .. } => AuditSeverity::Info,
            Self::RotationRolledBack { .. } | Self::TenantDeleted => AuditSeverity::Warning,
            Self::IntegrityViolation { .. } => AuditSeverity::Critical,
            Self::SecurityEvent { .. } => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        }
    }

    /// Reads and verification checks are informational; everything else
    /// mutates state.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::ConfigAccessed { .. }
                | Self::SecretAccessed { .. }
                | Self::SecretVerified { .. }
                | Self::AuthorizationCheck { allowed: true, .. }
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigCreated { version } => write!(f, "created v{version}"),
            Self::ConfigUpdated { version, .. } => write!(f, "updated to v{version}"),
            Self::ConfigDeleted { version } => write!(f, "deleted (tombstone v{version})"),
            Self::ConfigAccessed { version: Some(v) } => write!(f, "read v{v}"),
            Self::ConfigAccessed { version: None } => write!(f, "read latest"),
            Self::ConfigRolledBack { target, version } => {
                write!(f, "rolled back to v{target} as v{version}")
            }
            Self::TransactionCommitted { writes } => write!(f, "committed {writes} writes"),
            Self::ConfigExported { entries } => write!(f, "exported {entries} entries"),
            Self::SecretModified { version } => write!(f, "secret written as v{version}"),
            Self::SecretAccessed { version } => write!(f, "secret v{version} decrypted"),
            Self::SecretVerified { matched } => write!(f, "credential verified ({matched})"),
            Self::AuthorizationCheck { operation, allowed } => {
                let verdict = if *allowed { "allowed" } else { "denied" };
                write!(f, "{operation} {verdict}")
            }
            Self::RotationScheduled { job_id, trigger } => {
                write!(f, "rotation {job_id} scheduled ({trigger})")
            }
            Self::RotationTransition { job_id, from, to } => {
                write!(f, "rotation {job_id}: {from} -> {to}")
            }
            Self::RotationCancelled { job_id } => write!(f, "rotation {job_id} cancelled"),
            Self::RotationRolledBack { job_id, reason } => {
                write!(f, "rotation {job_id} rolled back: {reason}")
            }
            Self::TenantProvisioned => f.write_str("tenant provisioned"),
            Self::TenantUpdated => f.write_str("tenant updated"),
            Self::TenantDeleted => f.write_str("tenant deleted"),
            Self::RetentionApplied { removed } => write!(f, "retention removed {removed} versions"),
            Self::IntegrityViolation { reason } => write!(f, "integrity violation: {reason}"),
            Self::SecurityEvent { description } => f.write_str(description),
        }
    }
}

/// Outcome of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Operation succeeded.
    Success,

    /// Operation failed.
    Failure,

    /// Operation was denied.
    Denied,

    /// Operation timed out.
    Timeout,
}

/// Severity of an audit record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}
