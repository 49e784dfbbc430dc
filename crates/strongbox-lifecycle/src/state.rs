//! Rotation states and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a rotation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Scheduled,
    Generating,
    Validating,
    Activating,
    GracePeriod,
    Revoking,
    Completed,
    Failed,
    RolledBack,
}

impl RotationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Whether `self -> to` is a legal edge.
    pub fn can_transition_to(self, to: RotationState) -> bool {
        use RotationState::*;
        matches!(
            (self, to),
            (Scheduled, Generating)
                | (Scheduled, Failed)
                | (Generating, Validating)
                | (Generating, Failed)
                | (Validating, Activating)
                | (Validating, Failed)
                | (Activating, GracePeriod)
                | (Activating, Failed)
                | (Activating, RolledBack)
                | (GracePeriod, Revoking)
                | (GracePeriod, RolledBack)
                | (Revoking, Completed)
        )
    }

    /// Cancellation is only possible before the candidate becomes current.
    pub fn can_cancel(self) -> bool {
        matches!(self, Self::Scheduled | Self::Generating | Self::Validating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Activating => "activating",
            Self::GracePeriod => "grace_period",
            Self::Revoking => "revoking",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    /// Periodic, from the rotation interval.
    Scheduled,
    /// Suspected compromise. Runs immediately.
    Emergency,
    /// Operator request.
    Manual,
}

impl RotationTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Emergency => "emergency",
            Self::Manual => "manual",
        }
    }
}

/// Category of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Generation,
    Validation,
    HookTimeout,
    Cancelled,
    ErrorRate,
    Error,
}

/// Recorded when a job ends in `Failed` or `RolledBack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
