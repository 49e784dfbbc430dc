//! The engine façade.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use strongbox_audit::{
    AuditFilter, AuditLedger, AuditRecord, AuditSink, AuditStats, FileAuditSink, LedgerBuilder, MemoryAuditSink,
    TimeRange,
};
use strongbox_cache::{CacheStats, SharedCache, TieredCache, VersionTag};
use strongbox_core::clock::{self, SharedClock};
use strongbox_core::{
    logging, ActorId, AuditAction, AuditEvent, AuditOutcome, Config, EntryKey, Environment, Error, Namespace, Notifier,
    NullNotifier, Result, Tenant, TenantId, TenantQuotas, TenantStatus,
};
use strongbox_crypto::{EnvelopeEngine, KeyService, LocalKeyService, UsageRegistries};
use strongbox_lifecycle::{
    CredentialMatch, ErrorRateMonitor, FileJobRepository, JobRepository, MemoryJobRepository, RotationJob,
    RotationManager, RotationState, UsageTelemetry, ValidationHook,
};
use strongbox_store::{
    EntryValue, FileBackend, MemoryBackend, Patch, RetentionReport, StorageBackend, StoreBuilder, Transaction,
    VersionInfo, VersionedStore, WriteOptions,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authz::{AllowAll, Authorizer, Decision, Operation};
use crate::hook::AuditCommitHook;

/// A decrypted value and the version it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    pub key: EntryKey,
    pub version: VersionInfo,
    pub value: EntryValue,
}

/// One committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedWrite {
    pub key: EntryKey,
    pub version: VersionInfo,
}

/// Builder for [`Engine`]. Collaborators not supplied are derived from the
/// configuration.
pub struct EngineBuilder {
    config: Config,
    key_service: Option<Arc<dyn KeyService>>,
    backend: Option<Arc<dyn StorageBackend>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    jobs: Option<Arc<dyn JobRepository>>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    authorizer: Arc<dyn Authorizer>,
    validator: Option<Arc<dyn ValidationHook>>,
    telemetry: Option<Arc<dyn UsageTelemetry>>,
    error_monitor: Option<Arc<dyn ErrorRateMonitor>>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    background: bool,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            key_service: None,
            backend: None,
            audit_sink: None,
            jobs: None,
            shared_cache: None,
            authorizer: Arc::new(AllowAll),
            validator: None,
            telemetry: None,
            error_monitor: None,
            notifier: Arc::new(NullNotifier),
            clock: clock::system(),
            background: true,
        }
    }

    pub fn key_service(mut self, keys: Arc<dyn KeyService>) -> Self {
        self.key_service = Some(keys);
        self
    }

    pub fn storage_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn job_repository(mut self, jobs: Arc<dyn JobRepository>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn shared_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ValidationHook>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn UsageTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn error_monitor(mut self, monitor: Arc<dyn ErrorRateMonitor>) -> Self {
        self.error_monitor = Some(monitor);
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

    /// Skip the cache invalidation and rotation scheduler tasks. Callers then
    /// drive rotation with [`Engine::tick`].
    pub fn without_background_tasks(mut self) -> Self {
        self.background = false;
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;

        let keys: Arc<dyn KeyService> = match self.key_service {
            Some(keys) => keys,
            None => Arc::new(LocalKeyService::from_config(&config.crypto).await?),
        };
        let crypto = EnvelopeEngine::new(keys, config.crypto.clone());
        let usage = Arc::new(UsageRegistries::new(&config.crypto));

        let sink: Arc<dyn AuditSink> = match (self.audit_sink, &config.audit.log_path) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(FileAuditSink::new(path.clone())),
            (None, None) => Arc::new(MemoryAuditSink::new()),
        };
        let ledger = LedgerBuilder::new(sink, config.audit.clone())
            .notifier(self.notifier.clone())
            .clock(self.clock.clone())
            .open()
            .await?;
        let ledger = Arc::new(ledger);

        let backend: Arc<dyn StorageBackend> = match (self.backend, &config.store.data_dir) {
            (Some(backend), _) => backend,
            (None, Some(dir)) => Arc::new(FileBackend::new(dir.clone())),
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        let store = StoreBuilder::new(config.store.clone(), backend, crypto, usage)
            .hook(Arc::new(AuditCommitHook::new(ledger.clone())))
            .notifier(self.notifier.clone())
            .clock(self.clock.clone())
            .open()
            .await?;
        let store = Arc::new(store);

        let mut cache = TieredCache::new(config.cache.clone(), store.clone()).with_clock(self.clock.clone());
        if let Some(shared) = self.shared_cache {
            cache = cache.with_shared(shared);
        }
        let cache = Arc::new(cache);

        let jobs: Arc<dyn JobRepository> = match (self.jobs, &config.rotation.jobs_dir) {
            (Some(jobs), _) => jobs,
            (None, Some(dir)) => Arc::new(FileJobRepository::new(dir.clone())),
            (None, None) => Arc::new(MemoryJobRepository::new()),
        };
        let mut rotation = RotationManager::builder(store.clone(), config.rotation.clone())
            .repository(jobs)
            .notifier(self.notifier.clone())
            .clock(self.clock.clone())
            .audit(ledger.clone());
        if let Some(validator) = self.validator {
            rotation = rotation.validator(validator);
        }
        if let Some(telemetry) = self.telemetry {
            rotation = rotation.telemetry(telemetry);
        }
        if let Some(monitor) = self.error_monitor {
            rotation = rotation.error_monitor(monitor);
        }
        let rotation = Arc::new(rotation.build());
        rotation.recover().await?;

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        if self.background {
            tasks.push(cache.spawn_invalidation(shutdown.child_token()));
            tasks.push(rotation.spawn_scheduler(config.rotation.tick_interval(), shutdown.child_token()));
        }

        info!(
            tenants = store.list_tenants().len(),
            background = self.background,
            "strongbox engine started"
        );
        Ok(Engine {
            store,
            cache,
            rotation,
            ledger,
            authorizer: self.authorizer,
            transactions: DashMap::new(),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Multi-tenant configuration and secrets engine.
///
/// Every operation is authorized first. Mutations are audited synchronously
/// and fail if the audit write fails; reads are audited on a buffered path.
pub struct Engine {
    store: Arc<VersionedStore>,
    cache: Arc<TieredCache>,
    rotation: Arc<RotationManager>,
    ledger: Arc<AuditLedger>,
    authorizer: Arc<dyn Authorizer>,
    transactions: DashMap<String, Transaction>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Load configuration (JSON5, then `STRONGBOX_*` overrides), install
    /// logging, and start an engine with default collaborators.
    pub async fn from_config_file(path: Option<&Path>) -> Result<Self> {
        let config = Config::load_or_default(path)?;
        logging::init(&config.logging);
        Self::builder(config).build().await
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn rotation(&self) -> &Arc<RotationManager> {
        &self.rotation
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Resolve and decrypt `key` at `version` (latest live when `None`).
    pub async fn get(&self, actor: &ActorId, key: &EntryKey, version: Option<u64>) -> Result<ResolvedValue> {
        self.authorize_key(actor, key, Operation::Read).await?;

        let stored = self.cache.get(key, VersionTag::from_request(version)).await?;
        let value = self.store.reveal(key, &stored).await?;

        let action = match value {
            EntryValue::Secret(_) => AuditAction::SecretAccessed {
                version: stored.number,
            },
            EntryValue::Plain(_) => AuditAction::ConfigAccessed {
                version: Some(stored.number),
            },
        };
        self.ledger.record_informational(
            AuditEvent::new(actor.clone(), key.resource(), action, AuditOutcome::Success)
                .with_tenant(key.tenant.clone()),
        );

        Ok(ResolvedValue {
            key: key.clone(),
            version: stored.info(),
            value,
        })
    }

    /// Resolve `key` in `environment`, falling back through the layers it
    /// inherits. The result's key names the layer that supplied the value.
    pub async fn get_with_overrides(
        &self,
        actor: &ActorId,
        key: &EntryKey,
        environment: Environment,
    ) -> Result<ResolvedValue> {
        let base = key.in_environment(Environment::Base);
        self.authorize_key(actor, &base, Operation::Read).await?;

        let resolved = self.store.get_with_overrides(&base, environment).await?;
        let value = self.store.reveal(&resolved.key, &resolved.version).await?;
        let number = resolved.version.number;
        let action = match value {
            EntryValue::Secret(_) => AuditAction::SecretAccessed { version: number },
            EntryValue::Plain(_) => AuditAction::ConfigAccessed { version: Some(number) },
        };
        self.ledger.record_informational(
            AuditEvent::new(actor.clone(), resolved.key.resource(), action, AuditOutcome::Success)
                .with_tenant(key.tenant.clone()),
        );

        Ok(ResolvedValue {
            key: resolved.key,
            version: resolved.version.info(),
            value,
        })
    }

    /// Latest live values of several keys from one consistent snapshot.
    pub async fn get_many(&self, actor: &ActorId, keys: &[EntryKey]) -> Result<Vec<Option<ResolvedValue>>> {
        for key in keys {
            self.authorize_key(actor, key, Operation::Read).await?;
        }

        let versions = self.store.get_many(keys).await?;
        let mut out = Vec::with_capacity(keys.len());
        for (key, version) in keys.iter().zip(versions) {
            let resolved = match version {
                Some(v) => Some(ResolvedValue {
                    key: key.clone(),
                    version: v.info(),
                    value: self.store.reveal(key, &v).await?,
                }),
                None => None,
            };
            out.push(resolved);
        }
        Ok(out)
    }

    pub async fn list_versions(&self, actor: &ActorId, key: &EntryKey) -> Result<Vec<VersionInfo>> {
        self.authorize_key(actor, key, Operation::Read).await?;
        Ok(self.store.list_versions(key).await?)
    }

    pub async fn list_keys(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        namespace: &Namespace,
        recursive: bool,
    ) -> Result<Vec<EntryKey>> {
        let resource = format!("{tenant}:{namespace}");
        self.authorize(actor, Some(tenant), &resource, Operation::Read).await?;
        Ok(self.store.list_keys(tenant, namespace, recursive).await?)
    }

    /// Structural diff between two versions. Secret contents are redacted.
    pub async fn diff(&self, actor: &ActorId, key: &EntryKey, from: u64, to: u64) -> Result<Patch> {
        self.authorize_key(actor, key, Operation::Read).await?;
        Ok(self.store.diff(key, from, to).await?)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn put(&self, actor: &ActorId, key: &EntryKey, value: EntryValue, opts: WriteOptions) -> Result<VersionInfo> {
        self.authorize_key(actor, key, Operation::Write).await?;
        let version = self.store.put(actor, key, value, opts).await?;
        Ok(version.info())
    }

    pub async fn delete(&self, actor: &ActorId, key: &EntryKey, opts: WriteOptions) -> Result<VersionInfo> {
        self.authorize_key(actor, key, Operation::Write).await?;
        Ok(self.store.delete(actor, key, opts).await?.info())
    }

    /// Make `target` current again by appending a copy of it.
    pub async fn rollback(
        &self,
        actor: &ActorId,
        key: &EntryKey,
        target: u64,
        opts: WriteOptions,
    ) -> Result<VersionInfo> {
        self.authorize_key(actor, key, Operation::Write).await?;
        Ok(self.store.rollback(actor, key, target, opts).await?.info())
    }

    pub async fn begin_transaction(&self, actor: &ActorId) -> Result<String> {
        let tx = self.store.begin(actor.clone());
        let id = tx.id().to_string();
        self.transactions.insert(id.clone(), tx);
        Ok(id)
    }

    pub async fn stage_set(
        &self,
        actor: &ActorId,
        tx_id: &str,
        key: &EntryKey,
        value: EntryValue,
        expected_version: Option<u64>,
    ) -> Result<()> {
        self.authorize_key(actor, key, Operation::Write).await?;
        let mut tx = self.owned_transaction(actor, tx_id)?;
        tx.stage_set(key.clone(), value, expected_version);
        Ok(())
    }

    pub async fn stage_delete(
        &self,
        actor: &ActorId,
        tx_id: &str,
        key: &EntryKey,
        expected_version: Option<u64>,
    ) -> Result<()> {
        self.authorize_key(actor, key, Operation::Write).await?;
        let mut tx = self.owned_transaction(actor, tx_id)?;
        tx.stage_delete(key.clone(), expected_version);
        Ok(())
    }

    /// Apply every staged write, or none of them.
    pub async fn commit(&self, actor: &ActorId, tx_id: &str) -> Result<Vec<CommittedWrite>> {
        drop(self.owned_transaction(actor, tx_id)?);
        let (_, tx) = self
            .transactions
            .remove(tx_id)
            .ok_or_else(|| Error::NotFound(format!("transaction {tx_id}")))?;

        let entries = self.store.commit(tx).await?;
        Ok(entries
            .into_iter()
            .map(|e| CommittedWrite {
                version: e.version.info(),
                key: e.key,
            })
            .collect())
    }

    pub fn abort(&self, actor: &ActorId, tx_id: &str) -> Result<()> {
        drop(self.owned_transaction(actor, tx_id)?);
        if let Some((_, tx)) = self.transactions.remove(tx_id) {
            self.store.abort(tx);
        }
        Ok(())
    }

    fn owned_transaction(
        &self,
        actor: &ActorId,
        tx_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Transaction>> {
        let tx = self
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| Error::NotFound(format!("transaction {tx_id}")))?;
        if tx.actor() != actor {
            return Err(Error::denied(format!("transaction {tx_id} belongs to another actor")));
        }
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------

    pub async fn schedule_rotation(&self, actor: &ActorId, key: &EntryKey, at: DateTime<Utc>) -> Result<RotationJob> {
        self.authorize_key(actor, key, Operation::Rotate).await?;
        Ok(self.rotation.schedule_rotation(key, at, actor).await?)
    }

    /// Rotate now. Fails with `RotationFailure` if the job did not reach its
    /// grace period.
    pub async fn trigger_emergency_rotation(&self, actor: &ActorId, key: &EntryKey) -> Result<RotationJob> {
        self.authorize_key(actor, key, Operation::Rotate).await?;
        let job = self.rotation.trigger_emergency_rotation(key, actor).await?;
        match job.state {
            RotationState::Failed | RotationState::RolledBack => {
                let reason = job
                    .failure
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_else(|| job.state.to_string());
                Err(Error::RotationFailure(format!("rotation {} failed: {reason}", job.id)))
            }
            _ => Ok(job),
        }
    }

    pub async fn cancel_rotation(&self, actor: &ActorId, key: &EntryKey) -> Result<RotationJob> {
        self.authorize_key(actor, key, Operation::Rotate).await?;
        Ok(self.rotation.cancel_rotation(key, actor).await?)
    }

    /// Invalidate the previous value now instead of waiting out the grace
    /// period.
    pub async fn force_revoke(&self, actor: &ActorId, key: &EntryKey) -> Result<RotationJob> {
        self.authorize_key(actor, key, Operation::Rotate).await?;
        Ok(self.rotation.force_revoke(key, actor).await?)
    }

    pub async fn get_rotation_status(&self, actor: &ActorId, key: &EntryKey) -> Result<Option<RotationJob>> {
        self.authorize_key(actor, key, Operation::Read).await?;
        Ok(self.rotation.get_rotation_status(key))
    }

    /// Check a presented credential. Anything but the current value, or the
    /// previous value during its grace period, is `AuthorizationDenied`.
    pub async fn verify_secret(&self, actor: &ActorId, key: &EntryKey, presented: &[u8]) -> Result<CredentialMatch> {
        self.authorize_key(actor, key, Operation::VerifySecret).await?;

        let result = self.rotation.verify_credential(key, presented).await;
        let (matched, outcome) = match &result {
            Ok(CredentialMatch::Current(v)) => (format!("current v{v}"), AuditOutcome::Success),
            Ok(CredentialMatch::Previous(v)) => (format!("previous v{v}"), AuditOutcome::Success),
            Err(_) => ("none".to_string(), AuditOutcome::Denied),
        };
        self.ledger.record_informational(
            AuditEvent::new(actor.clone(), key.resource(), AuditAction::SecretVerified { matched }, outcome)
                .with_tenant(key.tenant.clone()),
        );
        Ok(result?)
    }

    /// Run due rotation steps now.
    pub async fn tick(&self) -> usize {
        self.rotation.tick().await
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    pub async fn query_audit_log(
        &self,
        actor: &ActorId,
        filter: AuditFilter,
        range: TimeRange,
    ) -> Result<BoxStream<'static, AuditRecord>> {
        let resource = match &filter.tenant {
            Some(t) => format!("audit:{t}"),
            None => "audit:*".to_string(),
        };
        self.authorize(actor, filter.tenant.as_ref(), &resource, Operation::ReadAudit)
            .await?;
        Ok(self.ledger.query(filter, range).await?)
    }

    /// Recompute the audit hash chain. A mismatch halts the ledger.
    pub async fn verify_audit_chain(&self, actor: &ActorId) -> Result<u64> {
        self.authorize(actor, None, "audit:*", Operation::ReadAudit).await?;
        Ok(self.ledger.verify_chain().await?)
    }

    pub fn audit_stats(&self) -> AuditStats {
        self.ledger.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ------------------------------------------------------------------
    // Tenants
    // ------------------------------------------------------------------

    pub async fn provision_tenant(&self, actor: &ActorId, id: TenantId, quotas: TenantQuotas) -> Result<Tenant> {
        self.authorize(actor, Some(&id), &tenant_resource(&id), Operation::ManageTenant)
            .await?;
        self.record_tenant_event(actor, &id, AuditAction::TenantProvisioned).await?;
        let result = self.store.provision_tenant(id.clone(), quotas).await;
        self.settle_tenant_event(actor, &id, AuditAction::TenantProvisioned, result)
    }

    pub async fn update_tenant_quotas(&self, actor: &ActorId, id: &TenantId, quotas: TenantQuotas) -> Result<Tenant> {
        self.authorize(actor, Some(id), &tenant_resource(id), Operation::ManageTenant)
            .await?;
        self.record_tenant_event(actor, id, AuditAction::TenantUpdated).await?;
        let result = self.store.update_tenant_quotas(id, quotas).await;
        self.settle_tenant_event(actor, id, AuditAction::TenantUpdated, result)
    }

    pub async fn set_tenant_status(&self, actor: &ActorId, id: &TenantId, status: TenantStatus) -> Result<Tenant> {
        self.authorize(actor, Some(id), &tenant_resource(id), Operation::ManageTenant)
            .await?;
        self.record_tenant_event(actor, id, AuditAction::TenantUpdated).await?;
        let result = self.store.set_tenant_status(id, status).await;
        self.settle_tenant_event(actor, id, AuditAction::TenantUpdated, result)
    }

    /// Destroy the tenant's root key, then remove its data.
    pub async fn delete_tenant(&self, actor: &ActorId, id: &TenantId) -> Result<()> {
        self.authorize(actor, Some(id), &tenant_resource(id), Operation::ManageTenant)
            .await?;
        self.record_tenant_event(actor, id, AuditAction::TenantDeleted).await?;
        let result = self.store.delete_tenant(id).await;
        self.settle_tenant_event(actor, id, AuditAction::TenantDeleted, result)
    }

    /// Prune versions outside the tenant's retention policies.
    pub async fn apply_retention(&self, actor: &ActorId, tenant: &TenantId) -> Result<RetentionReport> {
        self.authorize(actor, Some(tenant), &tenant_resource(tenant), Operation::ManageTenant)
            .await?;
        let report = self.store.apply_retention(tenant).await?;
        if report.pruned_versions > 0 || !report.expired_keys.is_empty() {
            let event = AuditEvent::new(
                actor.clone(),
                tenant_resource(tenant),
                AuditAction::RetentionApplied {
                    removed: report.pruned_versions,
                },
                AuditOutcome::Success,
            )
            .with_tenant(tenant.clone());
            self.ledger.record(event).await?;
        }
        Ok(report)
    }

    /// Export every live entry of `tenant` into `dir`. Secrets are written
    /// sealed.
    pub async fn export_all(&self, actor: &ActorId, tenant: &TenantId, dir: &Path) -> Result<usize> {
        self.authorize(actor, Some(tenant), &tenant_resource(tenant), Operation::Read)
            .await?;
        let entries = self.store.export_all(tenant, dir).await?;
        let event = AuditEvent::new(
            actor.clone(),
            tenant_resource(tenant),
            AuditAction::ConfigExported { entries },
            AuditOutcome::Success,
        )
        .with_tenant(tenant.clone())
        .with_details(serde_json::json!({ "dir": dir.display().to_string() }));
        self.ledger.record(event).await?;
        Ok(entries)
    }

    async fn record_tenant_event(&self, actor: &ActorId, id: &TenantId, action: AuditAction) -> Result<()> {
        let event = AuditEvent::new(actor.clone(), tenant_resource(id), action, AuditOutcome::Success)
            .with_tenant(id.clone());
        self.ledger.record(event).await?;
        Ok(())
    }

    /// The intent was recorded up front; a failed operation gets a follow-up
    /// record so the trail reflects what actually happened.
    fn settle_tenant_event<T>(
        &self,
        actor: &ActorId,
        id: &TenantId,
        action: AuditAction,
        result: std::result::Result<T, strongbox_store::StoreError>,
    ) -> Result<T> {
        result.map_err(|e| {
            let event = AuditEvent::new(actor.clone(), tenant_resource(id), action, AuditOutcome::Failure)
                .with_tenant(id.clone())
                .with_details(serde_json::json!({ "error": e.to_string() }));
            self.ledger.record_informational(event);
            e.into()
        })
    }

    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------

    async fn authorize_key(&self, actor: &ActorId, key: &EntryKey, operation: Operation) -> Result<()> {
        self.authorize(actor, Some(&key.tenant), &key.resource(), operation)
            .await
    }

    async fn authorize(
        &self,
        actor: &ActorId,
        tenant: Option<&TenantId>,
        resource: &str,
        operation: Operation,
    ) -> Result<()> {
        match self.authorizer.authorize(actor, tenant, resource, operation).await {
            Decision::Allow => {
                debug!(actor = %actor, resource, operation = %operation, "authorized");
                Ok(())
            }
            Decision::Deny(reason) => {
                warn!(actor = %actor, resource, operation = %operation, reason = %reason, "authorization denied");
                let mut event = AuditEvent::new(
                    actor.clone(),
                    resource,
                    AuditAction::AuthorizationCheck {
                        operation: operation.to_string(),
                        allowed: false,
                    },
                    AuditOutcome::Denied,
                );
                if let Some(tenant) = tenant {
                    event = event.with_tenant(tenant.clone());
                }
                if let Err(e) = self.ledger.record(event).await {
                    error!(error = %e, "failed to audit authorization denial");
                }
                Err(Error::denied(format!("{operation} on {resource}: {reason}")))
            }
        }
    }

    /// Stop background tasks and drain the audit queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        if let Err(e) = self.ledger.flush().await {
            warn!(error = %e, "audit flush on shutdown failed");
        }
        info!("strongbox engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn tenant_resource(id: &TenantId) -> String {
    format!("tenant:{id}")
}
