//! # strongbox-lifecycle
//!
//! Secret rotation for Strongbox.
//!
//! A [`RotationJob`] moves through
//! `Scheduled → Generating → Validating → Activating → GracePeriod → Revoking → Completed`,
//! ending early in `Failed` (before activation) or `RolledBack` (after). Jobs
//! are persisted through a [`JobRepository`] on every transition and resumed
//! by [`RotationManager::recover`].

pub mod error;
pub mod hooks;
pub mod job;
pub mod manager;
pub mod repository;
pub mod state;

pub use error::{Result, RotationError};
pub use hooks::{
    check_strength, AcceptAll, ErrorRateMonitor, InMemoryUsageTelemetry, NoErrors, RandomSecretGenerator,
    SecretGenerator, UsageTelemetry, ValidationHook,
};
pub use job::{RotationJob, Transition};
pub use manager::{CredentialMatch, RotationManager, RotationManagerBuilder};
pub use repository::{FileJobRepository, JobRepository, MemoryJobRepository};
pub use state::{FailureKind, JobFailure, RotationState, RotationTrigger};
