//! Query filters for the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongbox_core::{ActorId, AuditOutcome, AuditSeverity, TenantId};

use crate::record::AuditRecord;

/// Record filter. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorId>,

    /// Matches resources starting with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_prefix: Option<String>,

    /// Action names (`config_updated`, `rotation_transition`, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AuditOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<AuditSeverity>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn resource_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = Some(prefix.into());
        self
    }

    pub fn action(mut self, name: impl Into<String>) -> Self {
        self.actions.push(name.into());
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn min_severity(mut self, severity: AuditSeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(tenant) = &self.tenant {
            if record.tenant.as_ref() != Some(tenant) {
                return false;
            }
        }
        if let Some(actor) = &self.actor {
            if &record.actor != actor {
                return false;
            }
        }
        if let Some(prefix) = &self.resource_prefix {
            if !record.resource.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if !self.actions.is_empty() && !self.actions.iter().any(|a| a == record.action.name()) {
            return false;
        }
        if let Some(outcome) = self.outcome {
            if record.outcome != outcome {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if record.severity < min {
                return false;
            }
        }
        true
    }
}

/// Half-open time range `[start, end)`. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at < e)
    }
}
