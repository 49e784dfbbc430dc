//! Rotation manager: drives jobs through the state machine.
//!
//! Every transition is audited, then persisted, then applied in memory, so a
//! restart resumes from the last durable state. Work on one secret is
//! serialized by a per-secret lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strongbox_audit::AuditLedger;
use strongbox_core::clock::{self, Clock, SharedClock};
use strongbox_core::config::RotationConfig;
use strongbox_core::secret::constant_time_eq;
use strongbox_core::{
    ActorId, AuditAction, AuditEvent, AuditOutcome, EntryKey, JobId, Notification, Notifier, NullNotifier,
    SecretBytes,
};
use strongbox_store::{EntryValue, StoreError, Version, VersionValue, VersionedStore, WriteOptions};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RotationError};
use crate::hooks::{
    check_strength, AcceptAll, ErrorRateMonitor, InMemoryUsageTelemetry, NoErrors, RandomSecretGenerator,
    SecretGenerator, UsageTelemetry, ValidationHook,
};
use crate::job::RotationJob;
use crate::repository::{JobRepository, MemoryJobRepository};
use crate::state::{FailureKind, JobFailure, RotationState, RotationTrigger};

/// Upper bound on transitions applied to one job per tick.
const MAX_STEPS_PER_TICK: usize = 16;

/// Which secret a presented credential matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMatch {
    Current(u64),
    /// The pre-rotation value, accepted during the grace period.
    Previous(u64),
}

/// Builder for [`RotationManager`].
pub struct RotationManagerBuilder {
    store: Arc<VersionedStore>,
    config: RotationConfig,
    repo: Arc<dyn JobRepository>,
    generator: Option<Arc<dyn SecretGenerator>>,
    validator: Arc<dyn ValidationHook>,
    telemetry: Arc<dyn UsageTelemetry>,
    monitor: Arc<dyn ErrorRateMonitor>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    audit: Option<Arc<AuditLedger>>,
}

impl RotationManagerBuilder {
    pub fn new(store: Arc<VersionedStore>, config: RotationConfig) -> Self {
        Self {
            store,
            config,
            repo: Arc::new(MemoryJobRepository::new()),
            generator: None,
            validator: Arc::new(AcceptAll),
            telemetry: Arc::new(InMemoryUsageTelemetry::new()),
            monitor: Arc::new(NoErrors),
            notifier: Arc::new(NullNotifier),
            clock: clock::system(),
            audit: None,
        }
    }

    pub fn repository(mut self, repo: Arc<dyn JobRepository>) -> Self {
        self.repo = repo;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn SecretGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ValidationHook>) -> Self {
        self.validator = validator;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn UsageTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn error_monitor(mut self, monitor: Arc<dyn ErrorRateMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Ledger that records every transition. Without one, transitions are
    /// only logged.
    pub fn audit(mut self, ledger: Arc<AuditLedger>) -> Self {
        self.audit = Some(ledger);
        self
    }

    pub fn build(self) -> RotationManager {
        let generator = self.generator.unwrap_or_else(|| {
            Arc::new(RandomSecretGenerator::new(
                self.store.crypto().clone(),
                self.config.generated_bytes,
            ))
        });
        RotationManager {
            store: self.store,
            config: self.config,
            repo: self.repo,
            generator,
            validator: self.validator,
            telemetry: self.telemetry,
            monitor: self.monitor,
            notifier: self.notifier,
            clock: self.clock,
            audit: self.audit,
            jobs: DashMap::new(),
            active: DashMap::new(),
            locks: DashMap::new(),
        }
    }
}

/// Secret lifecycle manager.
pub struct RotationManager {
    store: Arc<VersionedStore>,
    config: RotationConfig,
    repo: Arc<dyn JobRepository>,
    generator: Arc<dyn SecretGenerator>,
    validator: Arc<dyn ValidationHook>,
    telemetry: Arc<dyn UsageTelemetry>,
    monitor: Arc<dyn ErrorRateMonitor>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    audit: Option<Arc<AuditLedger>>,
    jobs: DashMap<JobId, RotationJob>,
    /// Non-terminal job per secret.
    active: DashMap<EntryKey, JobId>,
    locks: DashMap<EntryKey, Arc<Mutex<()>>>,
}

impl RotationManager {
    pub fn builder(store: Arc<VersionedStore>, config: RotationConfig) -> RotationManagerBuilder {
        RotationManagerBuilder::new(store, config)
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Reload persisted jobs. Candidates of jobs interrupted between
    /// validation and grace are validated again before use.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        for mut job in self.repo.load_all().await? {
            if !job.is_terminal() {
                if matches!(job.state, RotationState::Validating | RotationState::Activating) {
                    job.needs_revalidation = true;
                }
                if let Some(existing) = self.active.get(&job.secret) {
                    if *existing != job.id {
                        error!(secret = %job.secret, job_id = %job.id, other = %*existing, "second active rotation found on recovery");
                    }
                }
                self.active.insert(job.secret.clone(), job.id.clone());
                resumed += 1;
            }
            self.jobs.insert(job.id.clone(), job);
        }
        info!(resumed, total = self.jobs.len(), "rotation jobs recovered");
        Ok(resumed)
    }

    /// Schedule a rotation of `secret` at `at`.
    pub async fn schedule_rotation(&self, secret: &EntryKey, at: DateTime<Utc>, actor: &ActorId) -> Result<RotationJob> {
        let lock = self.lock_for(secret);
        let _guard = lock.lock().await;
        self.create_job(secret, at, RotationTrigger::Manual, actor).await
    }

    /// Rotate `secret` now. Returns once the new value is current and the
    /// previous one is in its grace period, or the job has failed.
    pub async fn trigger_emergency_rotation(&self, secret: &EntryKey, actor: &ActorId) -> Result<RotationJob> {
        let lock = self.lock_for(secret);
        let _guard = lock.lock().await;

        let job = match self.active_job(secret) {
            // An emergency takes over a job that has not activated yet.
            Some(job) if job.state.can_cancel() => {
                self.fail(job, FailureKind::Cancelled, "superseded by emergency rotation").await?;
                self.create_job(secret, self.clock.now(), RotationTrigger::Emergency, actor).await?
            }
            Some(job) => return Err(RotationError::AlreadyActive { secret: secret.clone(), job_id: job.id }),
            None => self.create_job(secret, self.clock.now(), RotationTrigger::Emergency, actor).await?,
        };
        warn!(secret = %secret, job_id = %job.id, actor = %actor, "emergency rotation");
        self.drive(job).await
    }

    /// Cancel the active rotation of `secret`. Only possible before the
    /// candidate is activated.
    pub async fn cancel_rotation(&self, secret: &EntryKey, actor: &ActorId) -> Result<RotationJob> {
        let lock = self.lock_for(secret);
        let _guard = lock.lock().await;

        let job = self
            .active_job(secret)
            .ok_or_else(|| RotationError::NotFound(format!("no active rotation for {secret}")))?;
        if !job.state.can_cancel() {
            return Err(RotationError::NotCancellable {
                job_id: job.id,
                state: job.state,
            });
        }

        self.audit(
            &job,
            actor,
            AuditAction::RotationCancelled {
                job_id: job.id.to_string(),
            },
            AuditOutcome::Success,
        )
        .await?;
        self.fail(job, FailureKind::Cancelled, format!("cancelled by {actor}")).await
    }

    /// End the grace period of `secret`'s rotation now.
    pub async fn force_revoke(&self, secret: &EntryKey, actor: &ActorId) -> Result<RotationJob> {
        let lock = self.lock_for(secret);
        let _guard = lock.lock().await;

        let job = self
            .active_job(secret)
            .ok_or_else(|| RotationError::NotFound(format!("no active rotation for {secret}")))?;
        if job.state != RotationState::GracePeriod {
            return Err(RotationError::invalid(format!(
                "rotation {} is {}, not in its grace period",
                job.id, job.state
            )));
        }
        let job = self
            .transition(job, RotationState::Revoking, Some(format!("forced by {actor}")))
            .await?;
        self.revoke(job).await
    }

    /// Active job for `secret`, else its most recent one.
    pub fn get_rotation_status(&self, secret: &EntryKey) -> Option<RotationJob> {
        self.active_job(secret).or_else(|| {
            self.jobs
                .iter()
                .filter(|j| &j.secret == secret)
                .max_by_key(|j| j.created_at)
                .map(|j| j.clone())
        })
    }

    pub fn get_job(&self, id: &JobId) -> Option<RotationJob> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Jobs, oldest first, optionally for one secret.
    pub fn list_jobs(&self, secret: Option<&EntryKey>) -> Vec<RotationJob> {
        let mut jobs: Vec<RotationJob> = self
            .jobs
            .iter()
            .filter(|j| secret.map_or(true, |s| &j.secret == s))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Apply at most one transition to `job_id`.
    pub async fn advance(&self, job_id: &JobId) -> Result<RotationJob> {
        let secret = self
            .jobs
            .get(job_id)
            .map(|j| j.secret.clone())
            .ok_or_else(|| RotationError::NotFound(format!("rotation job {job_id}")))?;

        let lock = self.lock_for(&secret);
        let _guard = lock.lock().await;
        let job = self
            .get_job(job_id)
            .ok_or_else(|| RotationError::NotFound(format!("rotation job {job_id}")))?;
        self.step(job).await
    }

    /// Advance every due job as far as it can go. Returns the number of
    /// transitions applied.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| j.is_due(now))
            .map(|j| j.id.clone())
            .collect();

        let mut applied = 0;
        for id in due {
            for _ in 0..MAX_STEPS_PER_TICK {
                let before = self.jobs.get(&id).map(|j| j.history.len());
                match self.advance(&id).await {
                    Ok(job) => {
                        if Some(job.history.len()) == before || job.is_terminal() {
                            if Some(job.history.len()) != before {
                                applied += 1;
                            }
                            break;
                        }
                        applied += 1;
                    }
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "rotation step failed");
                        break;
                    }
                }
            }
        }
        if applied > 0 {
            debug!(applied, "rotation tick");
        }
        applied
    }

    /// Run [`tick`](Self::tick) every `interval` until `shutdown` fires.
    pub fn spawn_scheduler(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("rotation scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.tick().await;
                    }
                }
            }
        })
    }

    /// Check `presented` against the current value of `secret` and, during a
    /// grace period, the previous one.
    pub async fn verify_credential(&self, secret: &EntryKey, presented: &[u8]) -> Result<CredentialMatch> {
        let now = self.clock.now();
        let current = self.store.get(secret, None).await?;
        if self.matches(secret, &current, presented).await? {
            self.telemetry.record_use(secret, current.number, now).await;
            return Ok(CredentialMatch::Current(current.number));
        }

        if let Some(job) = self.active_job(secret) {
            // The candidate can be current before the grace transition is
            // durable. The previous value stays valid in that window too.
            let in_grace = match job.state {
                RotationState::GracePeriod => true,
                RotationState::Activating => current.created_by == job.marker(),
                _ => false,
            };
            if let (true, Some(previous)) = (in_grace, job.previous_version) {
                let old = self.store.get(secret, Some(previous)).await?;
                if self.matches(secret, &old, presented).await? {
                    self.telemetry.record_use(secret, previous, now).await;
                    debug!(secret = %secret, version = previous, "previous secret accepted in grace");
                    return Ok(CredentialMatch::Previous(previous));
                }
            }
        }
        Err(RotationError::CredentialRejected(secret.clone()))
    }

    async fn matches(&self, secret: &EntryKey, version: &Version, presented: &[u8]) -> Result<bool> {
        match self.store.reveal(secret, version).await? {
            EntryValue::Secret(value) => Ok(constant_time_eq(value.expose(), presented)),
            EntryValue::Plain(_) => Err(RotationError::invalid(format!("{secret} is not a secret"))),
        }
    }

    // ------------------------------------------------------------------
    // State handlers
    // ------------------------------------------------------------------

    async fn step(&self, job: RotationJob) -> Result<RotationJob> {
        match job.state {
            RotationState::Scheduled if job.scheduled_at <= self.clock.now() => {
                self.transition(job, RotationState::Generating, None).await
            }
            RotationState::Generating => self.generate(job).await,
            RotationState::Validating => self.validate(job).await,
            RotationState::Activating => self.activate(job).await,
            RotationState::GracePeriod => self.watch_grace(job).await,
            RotationState::Revoking => self.revoke(job).await,
            _ => Ok(job),
        }
    }

    /// Step until the job reaches its grace period or a terminal state.
    async fn drive(&self, mut job: RotationJob) -> Result<RotationJob> {
        for _ in 0..MAX_STEPS_PER_TICK {
            if job.is_terminal() || job.state == RotationState::GracePeriod {
                break;
            }
            job = self.step(job).await?;
        }
        Ok(job)
    }

    async fn generate(&self, mut job: RotationJob) -> Result<RotationJob> {
        let current = match self.store.get(&job.secret, None).await {
            Ok(v) => v,
            Err(e) => return self.fail(job, FailureKind::Error, e.to_string()).await,
        };
        if !matches!(current.value, VersionValue::Secret(_)) {
            return self.fail(job, FailureKind::Error, "entry is not a secret").await;
        }

        let candidate = match self.generator.generate(&job.secret).await {
            Ok(c) => c,
            Err(e) => return self.fail(job, FailureKind::Generation, e.to_string()).await,
        };
        if let Err(e) = check_strength(candidate.expose(), self.config.min_length) {
            return self.fail(job, FailureKind::Generation, e.to_string()).await;
        }

        let usage = self.store.usage_for(&job.secret.tenant);
        let sealed = match self.store.crypto().seal(&job.secret.tenant, &usage, candidate.expose()).await {
            Ok(s) => s,
            Err(e) => return self.fail(job, FailureKind::Generation, e.to_string()).await,
        };

        job.previous_version = Some(current.number);
        job.candidate = Some(sealed);
        self.transition(job, RotationState::Validating, None).await
    }

    async fn validate(&self, mut job: RotationJob) -> Result<RotationJob> {
        if let Err(failure) = self.run_validation(&job).await {
            return self.fail(job, failure.kind, failure.message).await;
        }
        job.needs_revalidation = false;
        self.transition(job, RotationState::Activating, None).await
    }

    async fn activate(&self, mut job: RotationJob) -> Result<RotationJob> {
        let marker = job.marker();
        let head = match self.store.get(&job.secret, None).await {
            Ok(head) => head,
            Err(e) if e.is_retriable() => return Err(e.into()),
            Err(e) => return self.fail(job, FailureKind::Error, e.to_string()).await,
        };
        let already_written = head.created_by == marker;

        if job.needs_revalidation {
            if let Err(failure) = self.run_validation(&job).await {
                return if already_written {
                    job.candidate_version = Some(head.number);
                    self.roll_back(job, failure.kind, failure.message).await
                } else {
                    self.fail(job, failure.kind, failure.message).await
                };
            }
            job.needs_revalidation = false;
        }

        let version = if already_written {
            debug!(job_id = %job.id, version = head.number, "candidate already active");
            head.number
        } else {
            let candidate = self.open_candidate(&job).await?;
            let expected = job.previous_version.unwrap_or(head.number);
            let opts = WriteOptions::expecting(expected).with_description(format!("rotation {}", job.id));
            match self
                .store
                .put(&marker, &job.secret, EntryValue::Secret(candidate), opts)
                .await
            {
                Ok(v) => v.number,
                Err(StoreError::Conflict { current, .. }) => {
                    let msg = format!("secret changed during rotation (now v{current})");
                    return self.fail(job, FailureKind::Error, msg).await;
                }
                Err(e) if e.is_retriable() => return Err(e.into()),
                Err(e) => return self.fail(job, FailureKind::Error, e.to_string()).await,
            }
        };

        job.candidate_version = Some(version);
        if let Some(rate) = self.breached(&job.secret).await {
            let reason = self.breach_reason(rate);
            return self.roll_back(job, FailureKind::ErrorRate, reason).await;
        }

        let now = self.clock.now();
        let expires = now + self.config.grace_period();
        job.activated_at = Some(now);
        job.grace_expires_at = Some(expires);
        job.grace_hard_limit = Some(expires + self.config.max_grace_extension());

        let job = self
            .transition(job, RotationState::GracePeriod, Some(format!("v{version} active")))
            .await?;
        self.notify(Notification::info(
            "rotation.activated",
            job.secret.resource(),
            format!("v{version} is current; previous valid until {expires}"),
        ))
        .await;
        Ok(job)
    }

    async fn watch_grace(&self, mut job: RotationJob) -> Result<RotationJob> {
        if let Some(rate) = self.breached(&job.secret).await {
            let reason = self.breach_reason(rate);
            return self.roll_back(job, FailureKind::ErrorRate, reason).await;
        }

        let now = self.clock.now();
        let Some(expires) = job.grace_expires_at else {
            return self.transition(job, RotationState::Revoking, None).await;
        };
        if now < expires {
            return Ok(job);
        }

        let hard_limit = job.grace_hard_limit.unwrap_or(expires);
        if let Some(previous) = job.previous_version {
            let since = now - self.config.usage_quiet_period();
            if now < hard_limit && self.telemetry.used_since(&job.secret, previous, since).await {
                let extended = (now + self.config.usage_quiet_period()).min(hard_limit);
                job.grace_expires_at = Some(extended);
                job.updated_at = now;
                self.save(&job).await?;
                info!(job_id = %job.id, secret = %job.secret, until = %extended, "previous secret still in use; grace extended");
                self.notify(Notification::info(
                    "rotation.grace_extended",
                    job.secret.resource(),
                    format!("v{previous} still in use; grace extended to {extended}"),
                ))
                .await;
                return Ok(job);
            }
        }
        self.transition(job, RotationState::Revoking, None).await
    }

    async fn revoke(&self, mut job: RotationJob) -> Result<RotationJob> {
        job.candidate = None;
        let job = self.transition(job, RotationState::Completed, None).await?;
        self.notify(Notification::info(
            "rotation.completed",
            job.secret.resource(),
            format!("rotation {} completed", job.id),
        ))
        .await;

        if let Some(interval) = self.config.interval() {
            let next_at = self.clock.now() + interval;
            if let Err(e) = self
                .create_job(&job.secret, next_at, RotationTrigger::Scheduled, &ActorId::system())
                .await
            {
                warn!(secret = %job.secret, error = %e, "failed to schedule next rotation");
            }
        }
        Ok(job)
    }

    /// Restore the previous value and end the job in `RolledBack`.
    async fn roll_back(&self, mut job: RotationJob, kind: FailureKind, reason: String) -> Result<RotationJob> {
        let rollback_marker = ActorId::new(format!("rotation/{}/rollback", job.id));
        if let (Some(previous), Some(candidate)) = (job.previous_version, job.candidate_version) {
            let head = self.store.get(&job.secret, None).await?;
            if head.created_by == rollback_marker {
                debug!(job_id = %job.id, "previous secret already restored");
            } else if head.number == candidate {
                let opts = WriteOptions::expecting(candidate).with_description(format!("rollback of rotation {}", job.id));
                self.store
                    .rollback(&rollback_marker, &job.secret, previous, opts)
                    .await?;
            } else {
                warn!(job_id = %job.id, head = head.number, "secret changed after activation; not restoring");
            }
        }

        self.audit(
            &job,
            &job.actor,
            AuditAction::RotationRolledBack {
                job_id: job.id.to_string(),
                reason: reason.clone(),
            },
            AuditOutcome::Failure,
        )
        .await?;

        job.candidate = None;
        job.failure = Some(JobFailure::new(kind, reason.clone()));
        let job = self
            .transition(job, RotationState::RolledBack, Some(reason.clone()))
            .await?;
        error!(job_id = %job.id, secret = %job.secret, reason = %reason, "rotation rolled back");
        self.notify(Notification::alert("rotation.rolled_back", job.secret.resource(), reason))
            .await;
        Ok(job)
    }

    async fn fail(&self, mut job: RotationJob, kind: FailureKind, message: impl Into<String>) -> Result<RotationJob> {
        let message = message.into();
        job.candidate = None;
        job.failure = Some(JobFailure::new(kind, message.clone()));
        let job = self
            .transition(job, RotationState::Failed, Some(message.clone()))
            .await?;

        if kind == FailureKind::Cancelled {
            info!(job_id = %job.id, secret = %job.secret, "rotation cancelled");
        } else {
            error!(job_id = %job.id, secret = %job.secret, kind = ?kind, message = %message, "rotation failed");
            self.notify(Notification::alert("rotation.failed", job.secret.resource(), message))
                .await;
        }
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn create_job(
        &self,
        secret: &EntryKey,
        at: DateTime<Utc>,
        trigger: RotationTrigger,
        actor: &ActorId,
    ) -> Result<RotationJob> {
        if let Some(job_id) = self.active.get(secret).map(|id| id.clone()) {
            return Err(RotationError::AlreadyActive {
                secret: secret.clone(),
                job_id,
            });
        }
        let current = self.store.get(secret, None).await?;
        if !matches!(current.value, VersionValue::Secret(_)) {
            return Err(RotationError::invalid(format!("{secret} is not a secret")));
        }

        let job = RotationJob::new(secret.clone(), trigger, actor.clone(), at, self.clock.now());
        self.audit(
            &job,
            actor,
            AuditAction::RotationScheduled {
                job_id: job.id.to_string(),
                trigger: trigger.as_str().to_string(),
            },
            AuditOutcome::Success,
        )
        .await?;
        self.save(&job).await?;

        info!(job_id = %job.id, secret = %secret, at = %at, trigger = trigger.as_str(), "rotation scheduled");
        self.notify(Notification::info(
            "rotation.scheduled",
            secret.resource(),
            format!("{} rotation at {at}", trigger.as_str()),
        ))
        .await;
        Ok(job)
    }

    /// Audit, persist, then publish the new state.
    async fn transition(&self, mut job: RotationJob, to: RotationState, note: Option<String>) -> Result<RotationJob> {
        let from = job.state;
        job.transition(to, self.clock.now(), note)?;

        let outcome = match to {
            RotationState::Failed | RotationState::RolledBack => AuditOutcome::Failure,
            _ => AuditOutcome::Success,
        };
        self.audit(
            &job,
            &job.actor,
            AuditAction::RotationTransition {
                job_id: job.id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            },
            outcome,
        )
        .await?;
        self.save(&job).await?;

        info!(job_id = %job.id, secret = %job.secret, from = %from, to = %to, "rotation transition");
        Ok(job)
    }

    async fn save(&self, job: &RotationJob) -> Result<()> {
        self.repo.save(job).await?;
        if job.is_terminal() {
            self.active.remove_if(&job.secret, |_, id| *id == job.id);
        } else {
            self.active.insert(job.secret.clone(), job.id.clone());
        }
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn audit(&self, job: &RotationJob, actor: &ActorId, action: AuditAction, outcome: AuditOutcome) -> Result<()> {
        let Some(ledger) = &self.audit else {
            return Ok(());
        };
        let event = AuditEvent::new(actor.clone(), job.secret.resource(), action, outcome)
            .with_tenant(job.secret.tenant.clone())
            .with_details(json!({ "job_id": job.id, "trigger": job.trigger.as_str() }));
        ledger.record(event).await?;
        Ok(())
    }

    async fn run_validation(&self, job: &RotationJob) -> std::result::Result<(), JobFailure> {
        let candidate = self
            .open_candidate(job)
            .await
            .map_err(|e| JobFailure::new(FailureKind::Error, e.to_string()))?;

        let timeout = self.config.validation_timeout();
        match tokio::time::timeout(timeout, self.validator.validate(&job.secret, &candidate)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(JobFailure::new(FailureKind::Validation, reason)),
            Err(_) => Err(JobFailure::new(
                FailureKind::HookTimeout,
                format!("validation hook exceeded {timeout:?}"),
            )),
        }
    }

    async fn open_candidate(&self, job: &RotationJob) -> Result<SecretBytes> {
        let sealed = job
            .candidate
            .as_ref()
            .ok_or_else(|| RotationError::invalid(format!("rotation {} has no candidate", job.id)))?;
        Ok(self.store.crypto().decrypt_value(sealed, &job.secret.tenant).await?)
    }

    async fn breached(&self, secret: &EntryKey) -> Option<f64> {
        self.monitor
            .error_rate(secret)
            .await
            .filter(|rate| *rate > self.config.error_rate_threshold)
    }

    fn breach_reason(&self, rate: f64) -> String {
        format!(
            "error rate {rate:.3} exceeded threshold {:.3}",
            self.config.error_rate_threshold
        )
    }

    async fn notify(&self, notification: Notification) {
        self.notifier.notify(notification).await;
    }

    fn active_job(&self, secret: &EntryKey) -> Option<RotationJob> {
        let id = self.active.get(secret).map(|id| id.clone())?;
        self.get_job(&id)
    }

    fn lock_for(&self, secret: &EntryKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(secret.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::FileJobRepository;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex as SyncMutex;
    use strongbox_audit::{AuditError, AuditRecord, AuditSink, LedgerBuilder, MemoryAuditSink};
    use strongbox_core::config::{AuditConfig, CryptoConfig, StoreConfig};
    use strongbox_core::retry::RetryPolicy;
    use strongbox_core::notify::RecordingNotifier;
    use strongbox_core::{ManualClock, TenantId, TenantQuotas};
    use strongbox_crypto::{EnvelopeEngine, LocalKeyService, MasterKey, UsageRegistries};
    use strongbox_store::{MemoryBackend, StoreBuilder};
    use tempfile::TempDir;

    struct Harness {
        store: Arc<VersionedStore>,
        clock: ManualClock,
        notifier: Arc<RecordingNotifier>,
        telemetry: Arc<InMemoryUsageTelemetry>,
    }

    impl Harness {
        async fn new() -> Self {
            let clock = ManualClock::starting_now();
            let crypto = EnvelopeEngine::new(
                Arc::new(LocalKeyService::new(MasterKey::generate())),
                CryptoConfig::default(),
            );
            let usage = Arc::new(UsageRegistries::new(&CryptoConfig::default()));
            let store = StoreBuilder::new(StoreConfig::default(), Arc::new(MemoryBackend::new()), crypto, usage)
                .clock(Arc::new(clock.clone()))
                .open()
                .await
                .unwrap();
            store
                .provision_tenant(TenantId::new("acme").unwrap(), TenantQuotas::default())
                .await
                .unwrap();
            store
                .put(&alice(), &secret(), EntryValue::secret("old-password-value"), WriteOptions::default())
                .await
                .unwrap();

            Self {
                store: Arc::new(store),
                clock,
                notifier: Arc::new(RecordingNotifier::new()),
                telemetry: Arc::new(InMemoryUsageTelemetry::new()),
            }
        }

        fn builder(&self) -> RotationManagerBuilder {
            RotationManager::builder(self.store.clone(), RotationConfig::default())
                .clock(Arc::new(self.clock.clone()))
                .notifier(self.notifier.clone())
                .telemetry(self.telemetry.clone())
        }

        fn manager(&self) -> RotationManager {
            self.builder().build()
        }
    }

    fn alice() -> ActorId {
        ActorId::new("alice")
    }

    fn secret() -> EntryKey {
        EntryKey::parse("acme", "db", "password").unwrap()
    }

    struct Reject;

    #[async_trait]
    impl ValidationHook for Reject {
        async fn validate(&self, _: &EntryKey, _: &SecretBytes) -> std::result::Result<(), String> {
            Err("downstream login failed".into())
        }
    }

    struct Hang;

    #[async_trait]
    impl ValidationHook for Hang {
        async fn validate(&self, _: &EntryKey, _: &SecretBytes) -> std::result::Result<(), String> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Rate(SyncMutex<Option<f64>>);

    #[async_trait]
    impl ErrorRateMonitor for Rate {
        async fn error_rate(&self, _: &EntryKey) -> Option<f64> {
            *self.0.lock().unwrap()
        }
    }

    async fn current_value(store: &VersionedStore) -> EntryValue {
        let v = store.get(&secret(), None).await.unwrap();
        store.reveal(&secret(), &v).await.unwrap()
    }

    #[tokio::test]
    async fn test_full_rotation_with_grace() {
        let h = Harness::new().await;
        let manager = h.manager();

        let job = manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();
        assert_eq!(job.state, RotationState::GracePeriod);
        assert_eq!(job.previous_version, Some(1));
        assert_eq!(job.candidate_version, Some(2));

        let head = h.store.get(&secret(), None).await.unwrap();
        assert_eq!(head.created_by, job.marker());

        // Both values valid during grace.
        assert_eq!(
            manager.verify_credential(&secret(), b"old-password-value").await.unwrap(),
            CredentialMatch::Previous(1)
        );
        let EntryValue::Secret(new_value) = current_value(&h.store).await else {
            panic!("expected secret");
        };
        assert_eq!(
            manager.verify_credential(&secret(), new_value.expose()).await.unwrap(),
            CredentialMatch::Current(2)
        );

        // Past grace with no recent use of the old value: revoked.
        h.clock.advance(ChronoDuration::seconds(601 + 60));
        manager.tick().await;
        let done = manager.get_rotation_status(&secret()).unwrap();
        assert_eq!(done.state, RotationState::Completed);
        assert!(done.candidate.is_none());

        let err = manager
            .verify_credential(&secret(), b"old-password-value")
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::CredentialRejected(_)));
        assert_eq!(h.notifier.events("rotation.completed").len(), 1);
    }

    #[tokio::test]
    async fn test_grace_extended_while_previous_in_use() {
        let h = Harness::new().await;
        let manager = h.manager();
        manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();

        h.clock.advance(ChronoDuration::seconds(600));
        manager.verify_credential(&secret(), b"old-password-value").await.unwrap();
        h.clock.advance(ChronoDuration::seconds(1));
        manager.tick().await;

        let job = manager.get_rotation_status(&secret()).unwrap();
        assert_eq!(job.state, RotationState::GracePeriod);
        assert_eq!(h.notifier.events("rotation.grace_extended").len(), 1);

        // Extension never exceeds the hard limit, even if use continues.
        let hard_limit = job.grace_hard_limit.unwrap();
        h.clock.set(hard_limit);
        h.telemetry.record_use(&secret(), 1, hard_limit).await;
        manager.tick().await;
        assert_eq!(
            manager.get_rotation_status(&secret()).unwrap().state,
            RotationState::Completed
        );
    }

    #[tokio::test]
    async fn test_scheduled_job_waits_for_its_time() {
        let h = Harness::new().await;
        let manager = h.manager();
        let at = h.clock.now() + ChronoDuration::minutes(5);
        let job = manager.schedule_rotation(&secret(), at, &alice()).await.unwrap();

        assert_eq!(manager.tick().await, 0);
        assert_eq!(manager.get_job(&job.id).unwrap().state, RotationState::Scheduled);

        h.clock.advance(ChronoDuration::minutes(5));
        manager.tick().await;
        assert_eq!(manager.get_job(&job.id).unwrap().state, RotationState::GracePeriod);
    }

    #[tokio::test]
    async fn test_one_active_job_per_secret() {
        let h = Harness::new().await;
        let manager = h.manager();
        let at = h.clock.now() + ChronoDuration::hours(1);
        manager.schedule_rotation(&secret(), at, &alice()).await.unwrap();

        let err = manager.schedule_rotation(&secret(), at, &alice()).await.unwrap_err();
        assert!(matches!(err, RotationError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn test_plain_entries_cannot_rotate() {
        let h = Harness::new().await;
        let manager = h.manager();
        let plain = EntryKey::parse("acme", "db", "host").unwrap();
        h.store
            .put(&alice(), &plain, EntryValue::Plain(json!("db.local")), WriteOptions::default())
            .await
            .unwrap();

        let err = manager.schedule_rotation(&plain, h.clock.now(), &alice()).await.unwrap_err();
        assert!(matches!(err, RotationError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_secret_untouched() {
        let h = Harness::new().await;
        let manager = h.builder().validator(Arc::new(Reject)).build();

        let job = manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();
        assert_eq!(job.state, RotationState::Failed);
        assert_eq!(job.failure.as_ref().unwrap().kind, FailureKind::Validation);
        assert!(job.candidate.is_none());

        assert_eq!(h.store.list_versions(&secret()).await.unwrap().len(), 1);
        assert_eq!(current_value(&h.store).await, EntryValue::secret("old-password-value"));
        assert_eq!(h.notifier.events("rotation.failed").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_timeout_fails_job() {
        let h = Harness::new().await;
        let manager = h.builder().validator(Arc::new(Hang)).build();

        let job = manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();
        assert_eq!(job.state, RotationState::Failed);
        assert_eq!(job.failure.unwrap().kind, FailureKind::HookTimeout);
        assert_eq!(h.store.list_versions(&secret()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_rate_breach_rolls_back() {
        let h = Harness::new().await;
        let monitor = Arc::new(Rate::default());
        let manager = h.builder().error_monitor(monitor.clone()).build();

        manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();
        *monitor.0.lock().unwrap() = Some(0.5);
        manager.tick().await;

        let job = manager.get_rotation_status(&secret()).unwrap();
        assert_eq!(job.state, RotationState::RolledBack);
        let versions = h.store.list_versions(&secret()).await.unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(current_value(&h.store).await, EntryValue::secret("old-password-value"));
        assert_eq!(
            manager.verify_credential(&secret(), b"old-password-value").await.unwrap(),
            CredentialMatch::Current(3)
        );
        assert_eq!(h.notifier.events("rotation.rolled_back").len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_before_activation() {
        let h = Harness::new().await;
        let manager = h.manager();
        let at = h.clock.now() + ChronoDuration::hours(1);
        manager.schedule_rotation(&secret(), at, &alice()).await.unwrap();

        let cancelled = manager.cancel_rotation(&secret(), &alice()).await.unwrap();
        assert_eq!(cancelled.state, RotationState::Failed);
        assert_eq!(cancelled.failure.unwrap().kind, FailureKind::Cancelled);

        manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();
        let err = manager.cancel_rotation(&secret(), &alice()).await.unwrap_err();
        assert!(matches!(
            err,
            RotationError::NotCancellable {
                state: RotationState::GracePeriod,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_force_revoke_ends_grace() {
        let h = Harness::new().await;
        let manager = h.manager();
        manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();

        let job = manager.force_revoke(&secret(), &alice()).await.unwrap();
        assert_eq!(job.state, RotationState::Completed);
        assert!(manager
            .verify_credential(&secret(), b"old-password-value")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_next_rotation_scheduled_on_completion() {
        let h = Harness::new().await;
        let config = RotationConfig {
            interval_secs: Some(86_400),
            ..RotationConfig::default()
        };
        let manager = RotationManager::builder(h.store.clone(), config)
            .clock(Arc::new(h.clock.clone()))
            .build();

        manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();
        manager.force_revoke(&secret(), &alice()).await.unwrap();

        let next = manager.get_rotation_status(&secret()).unwrap();
        assert_eq!(next.state, RotationState::Scheduled);
        assert_eq!(next.trigger, RotationTrigger::Scheduled);
        assert_eq!(next.scheduled_at, h.clock.now() + ChronoDuration::days(1));
    }

    struct OfflineSink;

    #[async_trait]
    impl AuditSink for OfflineSink {
        fn name(&self) -> &str {
            "offline"
        }

        async fn append(&self, _: &AuditRecord) -> strongbox_audit::Result<()> {
            Err(AuditError::sink("sink offline"))
        }

        async fn load(&self) -> strongbox_audit::Result<Vec<AuditRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_audit_outage_blocks_rotation() {
        let h = Harness::new().await;
        let config = AuditConfig {
            write_retry: RetryPolicy::none(),
            ..AuditConfig::default()
        };
        let ledger = LedgerBuilder::new(Arc::new(OfflineSink), config).open().await.unwrap();
        let manager = h.builder().audit(Arc::new(ledger)).build();

        let err = manager
            .schedule_rotation(&secret(), h.clock.now(), &alice())
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Audit(_)));
        assert!(manager.get_rotation_status(&secret()).is_none());
    }

    #[tokio::test]
    async fn test_transitions_are_audited() {
        let h = Harness::new().await;
        let ledger = LedgerBuilder::new(Arc::new(MemoryAuditSink::new()), AuditConfig::default())
            .clock(Arc::new(h.clock.clone()))
            .open()
            .await
            .unwrap();
        let ledger = Arc::new(ledger);
        let manager = h.builder().audit(ledger.clone()).build();

        manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();
        // scheduled + four transitions
        assert_eq!(ledger.stats().appended, 5);
        assert_eq!(ledger.verify_chain().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_recovery_revalidates_and_resumes() {
        let h = Harness::new().await;
        let dir = TempDir::new().unwrap();
        let repo: Arc<dyn JobRepository> = Arc::new(FileJobRepository::new(dir.path()));

        let first = h.builder().repository(repo.clone()).build();
        let job = first
            .schedule_rotation(&secret(), h.clock.now(), &alice())
            .await
            .unwrap();
        // Generating, then Validating, then Activating.
        for _ in 0..3 {
            first.advance(&job.id).await.unwrap();
        }
        assert_eq!(first.get_job(&job.id).unwrap().state, RotationState::Activating);
        drop(first);

        // Restart with a validator that now rejects the candidate.
        let second = h.builder().repository(repo).validator(Arc::new(Reject)).build();
        assert_eq!(second.recover().await.unwrap(), 1);
        second.tick().await;

        let job = second.get_job(&job.id).unwrap();
        assert_eq!(job.state, RotationState::Failed);
        assert_eq!(h.store.list_versions(&secret()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activation_is_idempotent_after_restart() {
        let h = Harness::new().await;
        let repo: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let first = h.builder().repository(repo.clone()).build();
        let job = first.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();

        // Simulate a crash after the write but before GracePeriod was saved.
        let mut stale = job.clone();
        stale.state = RotationState::Activating;
        stale.history.pop();
        repo.save(&stale).await.unwrap();

        let second = h.builder().repository(repo).build();
        second.recover().await.unwrap();
        let resumed = second.advance(&job.id).await.unwrap();
        assert_eq!(resumed.state, RotationState::GracePeriod);
        assert_eq!(resumed.candidate_version, Some(2));
        assert_eq!(h.store.list_versions(&secret()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_breach_while_activating_rolls_back() {
        let h = Harness::new().await;
        let repo: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let first = h.builder().repository(repo.clone()).build();
        let job = first.trigger_emergency_rotation(&secret(), &alice()).await.unwrap();

        // Candidate written, GracePeriod never saved.
        let mut stale = job.clone();
        stale.state = RotationState::Activating;
        stale.history.pop();
        repo.save(&stale).await.unwrap();

        let monitor = Arc::new(Rate::default());
        *monitor.0.lock().unwrap() = Some(0.5);
        let second = h.builder().repository(repo).error_monitor(monitor).build();
        second.recover().await.unwrap();
        let resumed = second.advance(&job.id).await.unwrap();

        assert_eq!(resumed.state, RotationState::RolledBack);
        assert_eq!(resumed.failure.unwrap().kind, FailureKind::ErrorRate);
        assert_eq!(current_value(&h.store).await, EntryValue::secret("old-password-value"));
        assert_eq!(h.store.list_versions(&secret()).await.unwrap().len(), 3);
    }

    /// Fails exactly one append, counted from 1.
    struct FailNth {
        inner: MemoryAuditSink,
        seen: std::sync::atomic::AtomicUsize,
        nth: usize,
    }

    #[async_trait]
    impl AuditSink for FailNth {
        fn name(&self) -> &str {
            "fail-nth"
        }

        async fn append(&self, record: &AuditRecord) -> strongbox_audit::Result<()> {
            let n = self.seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if n == self.nth {
                return Err(AuditError::sink("sink hiccup"));
            }
            self.inner.append(record).await
        }

        async fn load(&self) -> strongbox_audit::Result<Vec<AuditRecord>> {
            self.inner.load().await
        }
    }

    #[tokio::test]
    async fn test_previous_secret_valid_while_grace_transition_pending() {
        let h = Harness::new().await;
        // scheduled, generating, validating, activating, then grace_period
        let sink = Arc::new(FailNth {
            inner: MemoryAuditSink::new(),
            seen: Default::default(),
            nth: 5,
        });
        let config = AuditConfig {
            write_retry: RetryPolicy::none(),
            ..AuditConfig::default()
        };
        let ledger = LedgerBuilder::new(sink, config).open().await.unwrap();
        let manager = h.builder().audit(Arc::new(ledger)).build();

        let err = manager.trigger_emergency_rotation(&secret(), &alice()).await.unwrap_err();
        assert!(matches!(err, RotationError::Audit(_)));

        let job = manager.get_rotation_status(&secret()).unwrap();
        assert_eq!(job.state, RotationState::Activating);
        let head = h.store.get(&secret(), None).await.unwrap();
        assert_eq!(head.created_by, job.marker());

        // New value is current, and the old one has not been cut off.
        assert_eq!(
            manager.verify_credential(&secret(), b"old-password-value").await.unwrap(),
            CredentialMatch::Previous(1)
        );
        let EntryValue::Secret(new_value) = current_value(&h.store).await else {
            panic!("expected secret");
        };
        assert_eq!(
            manager.verify_credential(&secret(), new_value.expose()).await.unwrap(),
            CredentialMatch::Current(2)
        );

        h.clock.advance(ChronoDuration::seconds(30));
        manager.tick().await;
        let job = manager.get_rotation_status(&secret()).unwrap();
        assert_eq!(job.state, RotationState::GracePeriod);
        assert_eq!(job.candidate_version, Some(2));
        assert_eq!(
            manager.verify_credential(&secret(), b"old-password-value").await.unwrap(),
            CredentialMatch::Previous(1)
        );
    }

    #[tokio::test]
    async fn test_scheduler_task_stops_on_cancel() {
        let h = Harness::new().await;
        let manager = Arc::new(h.manager());
        manager.schedule_rotation(&secret(), h.clock.now(), &alice()).await.unwrap();

        let token = CancellationToken::new();
        let handle = manager.spawn_scheduler(std::time::Duration::from_millis(10), token.clone());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(
            manager.get_rotation_status(&secret()).unwrap().state,
            RotationState::GracePeriod
        );
    }
}
