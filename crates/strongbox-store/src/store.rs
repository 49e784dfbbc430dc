//! The versioned store.

use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use strongbox_core::clock::{self, Clock, SharedClock};
use strongbox_core::config::{RetentionConfig, StoreConfig};
use strongbox_core::notify::{Notification, Notifier, NullNotifier};
use strongbox_core::retry::retry;
use strongbox_core::{
    ActorId, EntryKey, Environment, KekId, Namespace, Tenant, TenantId, TenantQuotas, TenantStatus,
};
use strongbox_crypto::{EnvelopeEngine, KeyUsageRegistry, UsageRegistries};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::backend::{write_private_file, StorageBackend};
use crate::chain::{ChainRecord, RetentionPlan, VersionChain};
use crate::diff::{diff_versions, Patch};
use crate::error::{Result, StoreError};
use crate::events::{CommitBatch, CommitHook, InvalidationBus, InvalidationEvent, NoopHook, PendingWrite, WriteKind};
use crate::tenants::{TenantRecord, TenantRegistry};
use crate::transaction::{StagedOp, Transaction};
use crate::types::{EntryValue, Version, VersionInfo, VersionValue, VersionedEntry, WriteOptions};

type ChainHandle = Arc<RwLock<VersionChain>>;

/// A write with its value already encrypted, ready to apply under lock.
struct PreparedWrite {
    key: EntryKey,
    op: PreparedOp,
    expected: Option<u64>,
    description: Option<String>,
}

enum PreparedOp {
    Value(VersionValue),
    Delete,
    Rollback(u64),
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub pruned_versions: usize,
    pub expired_keys: Vec<EntryKey>,
}

/// Builder for [`VersionedStore`].
pub struct StoreBuilder {
    config: StoreConfig,
    backend: Arc<dyn StorageBackend>,
    crypto: EnvelopeEngine,
    usage: Arc<UsageRegistries>,
    hook: Arc<dyn CommitHook>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
}

impl StoreBuilder {
    pub fn new(
        config: StoreConfig,
        backend: Arc<dyn StorageBackend>,
        crypto: EnvelopeEngine,
        usage: Arc<UsageRegistries>,
    ) -> Self {
        Self {
            config,
            backend,
            crypto,
            usage,
            hook: Arc::new(NoopHook),
            notifier: Arc::new(NullNotifier),
            clock: clock::system(),
        }
    }

    /// Hook run inside every commit, before persistence.
    pub fn hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Sink for operator alerts.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Load persisted state and open the store. Chains with gaps are
    /// quarantined and reported, not repaired.
    pub async fn open(self) -> Result<VersionedStore> {
        let tenants = TenantRegistry::load(self.backend.load_tenants().await?);
        let records = self.backend.load_chains().await?;

        let chains = DashMap::new();
        let populated = DashSet::new();
        for record in records {
            let chain = VersionChain::from_record(record);
            if let Some(reason) = chain.quarantine_reason() {
                error!(key = %chain.key(), reason, "corrupted version chain quarantined");
                self.notifier
                    .notify(Notification::alert(
                        "store.corruption",
                        chain.key().to_string(),
                        reason.to_string(),
                    ))
                    .await;
            }
            if !chain.is_empty() {
                populated.insert(chain.key().clone());
            }
            chains.insert(chain.key().clone(), Arc::new(RwLock::new(chain)));
        }

        info!(
            chains = chains.len(),
            tenants = tenants.list().len(),
            "versioned store opened"
        );

        Ok(VersionedStore {
            bus: InvalidationBus::new(self.config.event_capacity),
            config: self.config,
            backend: self.backend,
            crypto: self.crypto,
            usage: self.usage,
            hook: self.hook,
            notifier: self.notifier,
            clock: self.clock,
            tenants,
            chains,
            populated,
            commit_lock: Mutex::new(()),
        })
    }
}

/// Append-only, per-key version chains with multi-key transactions.
///
/// Single-key writes lock only their key. Transactions additionally hold a
/// commit lock while applying, and take every key lock in key order before
/// touching any of them, so readers see either none or all of a commit.
pub struct VersionedStore {
    config: StoreConfig,
    backend: Arc<dyn StorageBackend>,
    crypto: EnvelopeEngine,
    usage: Arc<UsageRegistries>,
    hook: Arc<dyn CommitHook>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    tenants: TenantRegistry,
    chains: DashMap<EntryKey, ChainHandle>,
    populated: DashSet<EntryKey>,
    bus: InvalidationBus,
    commit_lock: Mutex<()>,
}

impl VersionedStore {
    /// The invalidation bus mutations are published on.
    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<InvalidationEvent> {
        self.bus.subscribe()
    }

    pub fn crypto(&self) -> &EnvelopeEngine {
        &self.crypto
    }

    /// Operation counters for `tenant`'s data keys.
    pub fn usage_for(&self, tenant: &TenantId) -> Arc<KeyUsageRegistry> {
        self.usage.for_tenant(tenant)
    }

    // ------------------------------------------------------------------
    // Tenants
    // ------------------------------------------------------------------

    /// Provision a new tenant.
    pub async fn provision_tenant(&self, id: TenantId, quotas: TenantQuotas) -> Result<Tenant> {
        let root_key_ref = KekId::new(format!("{}:{}", self.crypto.key_service().id(), id));
        let tenant = Tenant::new(id, root_key_ref, quotas, self.clock.now());
        let record = self.tenants.prepare_new(tenant)?;
        self.persist_tenant(&record).await?;
        info!(tenant = %record.tenant.id, "tenant provisioned");
        let tenant = record.tenant.clone();
        self.tenants.commit(record);
        Ok(tenant)
    }

    pub fn tenant(&self, id: &TenantId) -> Option<Tenant> {
        self.tenants.get(id).map(|r| r.tenant)
    }

    pub fn list_tenants(&self) -> Vec<Tenant> {
        self.tenants.list()
    }

    pub async fn update_tenant_quotas(&self, id: &TenantId, quotas: TenantQuotas) -> Result<Tenant> {
        let record = self.tenants.with_quotas(id, quotas, self.clock.now())?;
        self.persist_tenant(&record).await?;
        let tenant = record.tenant.clone();
        self.tenants.commit(record);
        Ok(tenant)
    }

    pub async fn set_tenant_status(&self, id: &TenantId, status: TenantStatus) -> Result<Tenant> {
        let record = self.tenants.with_status(id, status, self.clock.now())?;
        self.persist_tenant(&record).await?;
        info!(tenant = %id, ?status, "tenant status changed");
        let tenant = record.tenant.clone();
        self.tenants.commit(record);
        Ok(tenant)
    }

    /// Set the retention policy for a namespace subtree.
    pub async fn set_retention(&self, tenant: &TenantId, namespace: Namespace, policy: RetentionConfig) -> Result<()> {
        let record = self.tenants.with_retention(tenant, namespace, policy)?;
        self.persist_tenant(&record).await?;
        self.tenants.commit(record);
        Ok(())
    }

    /// Delete a tenant.
    ///
    /// The tenant is first marked pending deletion, then its KEK is destroyed
    /// through the key service. Data is removed only after destruction is
    /// confirmed; on failure the tenant stays pending and the call can be
    /// repeated.
    pub async fn delete_tenant(&self, id: &TenantId) -> Result<()> {
        let pending = self
            .tenants
            .with_status(id, TenantStatus::PendingDeletion, self.clock.now())?;
        self.persist_tenant(&pending).await?;
        self.tenants.commit(pending);

        if let Err(err) = self.crypto.destroy_tenant_key(id).await {
            error!(tenant = %id, error = %err, "tenant key destruction failed; data retained");
            return Err(err.into());
        }

        let keys: Vec<EntryKey> = self
            .chains
            .iter()
            .filter(|e| &e.key().tenant == id)
            .map(|e| e.key().clone())
            .collect();

        for key in &keys {
            if let Some(handle) = self.handle(key) {
                let mut chain = handle.write().await;
                *chain = VersionChain::empty(key.clone());
            }
            self.chains.remove(key);
            self.populated.remove(key);
        }
        self.persist_removal(&keys).await?;

        let backend = self.backend.clone();
        let tenant_id = id.clone();
        retry(&self.config.backend_retry, "remove_tenant", || {
            let backend = backend.clone();
            let tenant_id = tenant_id.clone();
            async move { backend.remove_tenant(&tenant_id).await }
        })
        .await?;

        self.tenants.remove(id);
        self.usage.remove(id);
        self.bus.publish(InvalidationEvent::Tenant {
            tenant: id.clone(),
            at: self.clock.now(),
        });
        warn!(tenant = %id, keys = keys.len(), "tenant deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Latest live version, or the exact `version` (tombstones included).
    pub async fn get(&self, key: &EntryKey, version: Option<u64>) -> Result<Version> {
        self.tenants.readable(&key.tenant)?;
        let handle = self
            .handle(key)
            .ok_or_else(|| StoreError::not_found(key.to_string()))?;
        let chain = handle.read().await;

        let found = match version {
            Some(n) => chain.get(n),
            None => chain.live(),
        };
        debug!(key = %key, requested = ?version, found = found.map(|v| v.number), "get");
        found
            .cloned()
            .ok_or_else(|| match version {
                Some(n) => StoreError::not_found(format!("{key} v{n}")),
                None => StoreError::not_found(key.to_string()),
            })
    }

    /// Latest live versions of several keys under one snapshot.
    pub async fn get_many(&self, keys: &[EntryKey]) -> Result<Vec<Option<Version>>> {
        let mut order: Vec<&EntryKey> = keys.iter().collect();
        order.sort();
        order.dedup();

        for key in &order {
            self.tenants.readable(&key.tenant)?;
        }

        let mut guards = BTreeMap::new();
        for key in order {
            if let Some(handle) = self.handle(key) {
                guards.insert(key.clone(), handle.read_owned().await);
            }
        }

        Ok(keys
            .iter()
            .map(|k| guards.get(k).and_then(|c| c.live().cloned()))
            .collect())
    }

    /// Resolve `key` in `environment`. Layers are read under one snapshot and
    /// the most specific layer holding a live version wins. The returned
    /// entry's key names the layer that supplied the value.
    pub async fn get_with_overrides(&self, key: &EntryKey, environment: Environment) -> Result<VersionedEntry> {
        let layers: Vec<EntryKey> = environment
            .layers()
            .iter()
            .map(|layer| key.in_environment(*layer))
            .collect();
        let found = self.get_many(&layers).await?;

        let resolved = layers
            .into_iter()
            .zip(found)
            .rev()
            .find_map(|(layer, version)| version.map(|version| VersionedEntry { key: layer, version }));
        debug!(key = %key, environment = %environment, layer = ?resolved.as_ref().map(|e| e.key.environment), "get with overrides");
        resolved.ok_or_else(|| {
            StoreError::not_found(format!("{} in {environment}", key.in_environment(Environment::Base)))
        })
    }

    /// Write the live version of every key of `tenant` into `dir`, one
    /// pretty-printed JSON file per entry. Secrets stay sealed. Returns the
    /// number of files written.
    pub async fn export_all(&self, tenant: &TenantId, dir: &Path) -> Result<usize> {
        self.tenants.readable(tenant)?;
        let handles: Vec<(EntryKey, ChainHandle)> = self
            .chains
            .iter()
            .filter(|e| &e.key().tenant == tenant)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        tokio::fs::create_dir_all(dir).await?;
        let mut written = 0;
        for (key, handle) in handles {
            let Some(version) = handle.read().await.live().cloned() else {
                continue;
            };
            let file = format!(
                "{}_{}_{}_v{}.json",
                key.namespace.as_str().replace('/', "_"),
                key.key,
                key.environment,
                version.number
            );
            let entry = VersionedEntry { key, version };
            write_private_file(&dir.join(file), &serde_json::to_vec_pretty(&entry)?).await?;
            written += 1;
        }
        info!(tenant = %tenant, entries = written, dir = %dir.display(), "configuration exported");
        Ok(written)
    }

    /// Metadata for every retained version, oldest first.
    pub async fn list_versions(&self, key: &EntryKey) -> Result<Vec<VersionInfo>> {
        self.tenants.readable(&key.tenant)?;
        let handle = self
            .handle(key)
            .ok_or_else(|| StoreError::not_found(key.to_string()))?;
        let chain = handle.read().await;
        if chain.is_empty() {
            return Err(StoreError::not_found(key.to_string()));
        }
        Ok(chain.versions().iter().map(Version::info).collect())
    }

    /// Keys with a live version in `namespace` (and below, if `recursive`).
    pub async fn list_keys(&self, tenant: &TenantId, namespace: &Namespace, recursive: bool) -> Result<Vec<EntryKey>> {
        self.tenants.readable(tenant)?;
        let candidates: Vec<(EntryKey, ChainHandle)> = self
            .chains
            .iter()
            .filter(|e| {
                let k = e.key();
                &k.tenant == tenant
                    && if recursive {
                        k.namespace.is_within(namespace)
                    } else {
                        &k.namespace == namespace
                    }
            })
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut keys = Vec::new();
        for (key, handle) in candidates {
            if handle.read().await.live().is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Structural diff between two versions of a key.
    pub async fn diff(&self, key: &EntryKey, from: u64, to: u64) -> Result<Patch> {
        let a = self.get(key, Some(from)).await?;
        let b = self.get(key, Some(to)).await?;
        Ok(diff_versions(&a, &b))
    }

    /// Decrypt a stored version for the caller. Tombstones are `NotFound`.
    pub async fn reveal(&self, key: &EntryKey, version: &Version) -> Result<EntryValue> {
        match &version.value {
            VersionValue::Plain(v) => Ok(EntryValue::Plain(v.clone())),
            VersionValue::Secret(ev) => {
                let plaintext = self.crypto.decrypt_value(ev, &key.tenant).await?;
                Ok(EntryValue::Secret(plaintext))
            }
            VersionValue::Tombstone => Err(StoreError::not_found(format!(
                "{key} v{} is deleted",
                version.number
            ))),
        }
    }

    /// Keys currently refusing mutations.
    pub async fn quarantined_keys(&self) -> Vec<EntryKey> {
        let handles: Vec<ChainHandle> = self.chains.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let chain = handle.read().await;
            if chain.quarantine_reason().is_some() {
                out.push(chain.key().clone());
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write a new version.
    pub async fn put(&self, actor: &ActorId, key: &EntryKey, value: EntryValue, opts: WriteOptions) -> Result<Version> {
        let prepared = self.prepare(key.clone(), StagedOp::Set(value), opts).await?;
        self.apply_one(actor, prepared).await
    }

    /// Append a tombstone.
    pub async fn delete(&self, actor: &ActorId, key: &EntryKey, opts: WriteOptions) -> Result<Version> {
        let prepared = self.prepare(key.clone(), StagedOp::Delete, opts).await?;
        self.apply_one(actor, prepared).await
    }

    /// Append a new version copying `target`. History is never rewritten.
    pub async fn rollback(&self, actor: &ActorId, key: &EntryKey, target: u64, opts: WriteOptions) -> Result<Version> {
        let prepared = PreparedWrite {
            key: key.clone(),
            op: PreparedOp::Rollback(target),
            expected: opts.expected_version,
            description: opts
                .description
                .or_else(|| Some(format!("rollback to v{target}"))),
        };
        self.apply_one(actor, prepared).await
    }

    /// Start a transaction.
    pub fn begin(&self, actor: ActorId) -> Transaction {
        let tx = Transaction::new(actor, self.clock.now());
        debug!(transaction = tx.id(), "transaction started");
        tx
    }

    /// Discard a transaction. Nothing it staged was persisted.
    pub fn abort(&self, tx: Transaction) {
        debug!(transaction = tx.id(), staged = tx.len(), "transaction aborted");
    }

    /// Apply every staged write atomically.
    pub async fn commit(&self, tx: Transaction) -> Result<Vec<VersionedEntry>> {
        let (id, actor, staged) = tx.into_writes();
        if staged.is_empty() {
            return Ok(Vec::new());
        }

        // Encrypt before taking any lock.
        let mut prepared = Vec::with_capacity(staged.len());
        for (key, write) in staged {
            let opts = WriteOptions {
                expected_version: write.expected_version,
                description: write.description,
            };
            prepared.push(self.prepare(key, write.op, opts).await?);
        }

        let _commit = self.commit_lock.lock().await;
        let entries = self.apply(&actor, Some(id.clone()), prepared).await?;
        info!(transaction = %id, writes = entries.len(), "transaction committed");
        Ok(entries)
    }

    /// Remove expired versions for every key of `tenant`.
    pub async fn apply_retention(&self, tenant: &TenantId) -> Result<RetentionReport> {
        let record = self.tenants.readable(tenant)?;
        let now = self.clock.now();
        let handles: Vec<(EntryKey, ChainHandle)> = self
            .chains
            .iter()
            .filter(|e| &e.key().tenant == tenant)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut report = RetentionReport::default();
        for (key, handle) in handles {
            let policy = record
                .retention_for(&key.namespace)
                .unwrap_or(&self.config.default_retention);

            let mut chain = handle.write().await;
            match chain.retention_plan(policy, now) {
                RetentionPlan::Keep => continue,
                RetentionPlan::Prune(count) => {
                    self.persist(&[chain.record_pruned(count)]).await?;
                    chain.prune(count);
                    report.pruned_versions += count;
                }
                RetentionPlan::Expire => {
                    // The emptied chain stays persisted so its numbers are
                    // never issued again.
                    self.persist(&[chain.record_expired()]).await?;
                    report.pruned_versions += chain.len();
                    chain.expire();
                    self.populated.remove(&key);
                    report.expired_keys.push(key.clone());
                }
            }
            drop(chain);
            self.bus.publish(InvalidationEvent::Pruned { key, at: now });
        }

        if report.pruned_versions > 0 {
            info!(
                tenant = %tenant,
                pruned = report.pruned_versions,
                expired = report.expired_keys.len(),
                "retention applied"
            );
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handle(&self, key: &EntryKey) -> Option<ChainHandle> {
        self.chains.get(key).map(|e| e.value().clone())
    }

    fn handle_or_create(&self, key: &EntryKey) -> ChainHandle {
        self.chains
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(VersionChain::empty(key.clone()))))
            .clone()
    }

    /// Validate input and encrypt secrets. Runs without any lock held.
    async fn prepare(&self, key: EntryKey, op: StagedOp, opts: WriteOptions) -> Result<PreparedWrite> {
        let record = self.tenants.writable(&key.tenant)?;
        let op = match op {
            StagedOp::Delete => PreparedOp::Delete,
            StagedOp::Set(value) => {
                if let Some(max) = record.tenant.quotas.max_value_bytes {
                    if value.size() > max {
                        return Err(StoreError::QuotaExceeded(format!(
                            "{key}: value of {} bytes exceeds limit of {max}",
                            value.size()
                        )));
                    }
                }
                PreparedOp::Value(self.seal(&key.tenant, value).await?)
            }
        };
        Ok(PreparedWrite {
            key,
            op,
            expected: opts.expected_version,
            description: opts.description,
        })
    }

    async fn seal(&self, tenant: &TenantId, value: EntryValue) -> Result<VersionValue> {
        match value {
            EntryValue::Plain(v) => Ok(VersionValue::Plain(v)),
            EntryValue::Secret(bytes) => {
                let usage = self.usage.for_tenant(tenant);
                let ev = self.crypto.seal(tenant, &usage, bytes.expose()).await?;
                Ok(VersionValue::Secret(ev))
            }
        }
    }

    async fn apply_one(&self, actor: &ActorId, write: PreparedWrite) -> Result<Version> {
        let mut entries = self.apply(actor, None, vec![write]).await?;
        entries
            .pop()
            .map(|e| e.version)
            .ok_or_else(|| StoreError::Backend("commit produced no version".to_string()))
    }

    /// Lock, validate, run the hook, persist, apply, publish. A rejected
    /// batch leaves no chain behind for keys it would have created.
    async fn apply(
        &self,
        actor: &ActorId,
        transaction_id: Option<String>,
        mut writes: Vec<PreparedWrite>,
    ) -> Result<Vec<VersionedEntry>> {
        writes.sort_by(|a, b| a.key.cmp(&b.key));
        let keys: Vec<EntryKey> = writes.iter().map(|w| w.key.clone()).collect();
        let result = self.apply_locked(actor, transaction_id, writes).await;
        if result.is_err() {
            self.discard_unwritten(&keys);
        }
        result
    }

    /// Drop chain handles that were created for a failed write and that no
    /// other writer holds.
    fn discard_unwritten(&self, keys: &[EntryKey]) {
        for key in keys {
            self.chains.remove_if(key, |_, handle| {
                Arc::strong_count(handle) == 1 && handle.try_read().map_or(false, |c| c.never_written())
            });
        }
    }

    async fn apply_locked(
        &self,
        actor: &ActorId,
        transaction_id: Option<String>,
        writes: Vec<PreparedWrite>,
    ) -> Result<Vec<VersionedEntry>> {

        let mut quotas: BTreeMap<TenantId, TenantRecord> = BTreeMap::new();
        for w in &writes {
            if !quotas.contains_key(&w.key.tenant) {
                quotas.insert(w.key.tenant.clone(), self.tenants.writable(&w.key.tenant)?);
            }
        }

        let mut guards: Vec<OwnedRwLockWriteGuard<VersionChain>> = Vec::with_capacity(writes.len());
        for w in &writes {
            guards.push(self.handle_or_create(&w.key).write_owned().await);
        }

        let now = self.clock.now();
        let mut new_keys: BTreeMap<TenantId, usize> = BTreeMap::new();
        let mut versions = Vec::with_capacity(writes.len());
        let mut pending = Vec::with_capacity(writes.len());
        let mut records: Vec<ChainRecord> = Vec::with_capacity(writes.len());

        for (w, chain) in writes.into_iter().zip(guards.iter()) {
            chain.ensure_writable()?;
            chain.check_expected(w.expected)?;

            let limits = &quotas[&w.key.tenant].tenant.quotas;
            if let Some(max) = limits.max_versions_per_key {
                if chain.len() >= max {
                    return Err(StoreError::QuotaExceeded(format!(
                        "{} holds {} versions (limit {max}); apply retention first",
                        w.key,
                        chain.len()
                    )));
                }
            }

            let previous = chain.head().map(|v| v.number);
            let (value, kind) = match w.op {
                PreparedOp::Value(value) => {
                    let kind = if chain.live().is_some() {
                        WriteKind::Update
                    } else {
                        WriteKind::Create
                    };
                    (value, kind)
                }
                PreparedOp::Delete => {
                    if chain.live().is_none() {
                        return Err(StoreError::not_found(w.key.to_string()));
                    }
                    (VersionValue::Tombstone, WriteKind::Delete)
                }
                PreparedOp::Rollback(target) => {
                    let source = chain
                        .get(target)
                        .ok_or_else(|| StoreError::not_found(format!("{} v{target}", w.key)))?;
                    if source.value.is_tombstone() {
                        return Err(StoreError::validation(format!(
                            "{} v{target} is a tombstone; use delete instead",
                            w.key
                        )));
                    }
                    (source.value.clone(), WriteKind::Rollback { target })
                }
            };

            if chain.is_empty() {
                *new_keys.entry(w.key.tenant.clone()).or_default() += 1;
            }

            let version = Version {
                number: chain.next_number(),
                value,
                created_at: now,
                created_by: actor.clone(),
                description: w.description,
            };
            records.push(chain.record_with(&version));
            pending.push(PendingWrite {
                key: w.key.clone(),
                version: version.number,
                previous,
                secret: matches!(version.value, VersionValue::Secret(_)),
                kind,
            });
            versions.push(version);
        }

        for (tenant, added) in &new_keys {
            if let Some(max) = quotas[tenant].tenant.quotas.max_keys {
                let existing = self.populated.iter().filter(|k| &k.tenant == tenant).count();
                if existing + added > max {
                    return Err(StoreError::QuotaExceeded(format!(
                        "tenant {tenant} would hold {} keys (limit {max})",
                        existing + added
                    )));
                }
            }
        }

        let batch = CommitBatch {
            actor: actor.clone(),
            transaction_id,
            writes: pending,
        };
        self.hook
            .before_commit(&batch)
            .await
            .map_err(StoreError::Rejected)?;

        if let Err(err) = self.persist(&records).await {
            error!(error = %err, writes = batch.writes.len(), "commit persistence failed; nothing applied");
            self.hook.commit_failed(&batch, &err).await;
            return Err(err);
        }

        let mut entries = Vec::with_capacity(versions.len());
        for (mut chain, version) in guards.into_iter().zip(versions) {
            let key = chain.key().clone();
            chain.append(version.clone())?;
            self.populated.insert(key.clone());
            entries.push(VersionedEntry { key, version });
        }

        for entry in &entries {
            debug!(key = %entry.key, version = entry.version.number, "version written");
            self.bus.publish(InvalidationEvent::Key {
                key: entry.key.clone(),
                version: entry.version.number,
                at: now,
            });
        }
        Ok(entries)
    }

    async fn persist(&self, records: &[ChainRecord]) -> Result<()> {
        let backend = self.backend.clone();
        retry(&self.config.backend_retry, "write_chains", || {
            let backend = backend.clone();
            async move { backend.write_chains(records).await }
        })
        .await
    }

    async fn persist_removal(&self, keys: &[EntryKey]) -> Result<()> {
        let backend = self.backend.clone();
        retry(&self.config.backend_retry, "remove_chains", || {
            let backend = backend.clone();
            async move { backend.remove_chains(keys).await }
        })
        .await
    }

    async fn persist_tenant(&self, record: &TenantRecord) -> Result<()> {
        let backend = self.backend.clone();
        retry(&self.config.backend_retry, "save_tenant", || {
            let backend = backend.clone();
            async move { backend.save_tenant(record).await }
        })
        .await
    }

    /// Raise an operator alert for a corrupted scope.
    pub async fn alert_corruption(&self, scope: &str, reason: &str) {
        error!(scope, reason, "corruption detected");
        self.notifier
            .notify(Notification::alert("store.corruption", scope, reason))
            .await;
    }
}
