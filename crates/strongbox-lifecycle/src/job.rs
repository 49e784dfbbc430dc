//! Persisted rotation job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongbox_core::{ActorId, EntryKey, JobId};
use strongbox_crypto::EncryptedValue;

use crate::error::{Result, RotationError};
use crate::state::{JobFailure, RotationState, RotationTrigger};

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RotationState,
    pub to: RotationState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A rotation of one secret.
///
/// The candidate is only ever held sealed under the tenant's envelope key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationJob {
    pub id: JobId,
    pub secret: EntryKey,
    pub state: RotationState,
    pub trigger: RotationTrigger,
    pub actor: ActorId,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Version that was current when generation started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<u64>,

    /// Version written at activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_version: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<EncryptedValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,

    /// Latest instant the grace period may be extended to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_hard_limit: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,

    #[serde(default)]
    pub history: Vec<Transition>,

    /// Set on recovery: the candidate must pass validation again before use.
    #[serde(skip)]
    pub needs_revalidation: bool,
}

impl RotationJob {
    pub fn new(
        secret: EntryKey,
        trigger: RotationTrigger,
        actor: ActorId,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            secret,
            state: RotationState::Scheduled,
            trigger,
            actor,
            scheduled_at,
            created_at: now,
            updated_at: now,
            previous_version: None,
            candidate_version: None,
            candidate: None,
            activated_at: None,
            grace_expires_at: None,
            grace_hard_limit: None,
            failure: None,
            history: Vec::new(),
            needs_revalidation: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the scheduler should look at the job at `now`. Jobs in grace
    /// are always polled so an error-rate breach is noticed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            RotationState::Scheduled => self.scheduled_at <= now,
            s => !s.is_terminal(),
        }
    }

    /// Move to `to`, recording the edge. Illegal edges are rejected.
    pub fn transition(&mut self, to: RotationState, at: DateTime<Utc>, note: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(RotationError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.history.push(Transition {
            from: self.state,
            to,
            at,
            note,
        });
        self.state = to;
        self.updated_at = at;
        Ok(())
    }

    /// Marker stored as `created_by` on the version this job activates.
    pub fn marker(&self) -> ActorId {
        ActorId::new(format!("rotation/{}", self.id))
    }
}
