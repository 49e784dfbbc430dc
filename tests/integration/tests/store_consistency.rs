//! Optimistic concurrency, all-or-nothing transactions and cache
//! invalidation through the engine.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strongbox_audit::{AuditFilter, TimeRange};
use strongbox_cache::InMemorySharedCache;
use strongbox_core::{AuditOutcome, EntryKey, Error, TenantId, TenantQuotas};
use strongbox_crypto::{LocalKeyService, MasterKey};
use strongbox_engine::Engine;
use strongbox_integration_tests::{config_in, key, operator, tenant, Fixture};
use strongbox_store::{
    ChainRecord, EntryValue, MemoryBackend, StorageBackend, StoreError, TenantRecord, WriteOptions,
};
use tempfile::TempDir;

#[tokio::test]
async fn test_stale_expected_version_is_rejected() {
    let fx = Fixture::new().await;
    let key = key("feature.flags");
    fx.engine
        .put(&operator(), &key, EntryValue::Plain(json!({"beta": false})), WriteOptions::default())
        .await
        .unwrap();

    // Two writers both read v1.
    fx.engine
        .put(
            &operator(),
            &key,
            EntryValue::Plain(json!({"beta": true})),
            WriteOptions::expecting(1),
        )
        .await
        .unwrap();
    let err = fx
        .engine
        .put(
            &operator(),
            &key,
            EntryValue::Plain(json!({"beta": "maybe"})),
            WriteOptions::expecting(1),
        )
        .await
        .unwrap_err();

    match err {
        Error::Conflict { expected, current, .. } => {
            assert_eq!(expected, 1);
            assert_eq!(current, 2);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    let latest = fx.engine.store().get(&key, None).await.unwrap();
    assert_eq!(latest.number, 2);
}

#[tokio::test]
async fn test_conflict_inside_transaction_applies_nothing() {
    let fx = Fixture::new().await;
    fx.engine
        .put(&operator(), &key("a"), EntryValue::Plain(json!(1)), WriteOptions::default())
        .await
        .unwrap();

    let tx = fx.engine.begin_transaction(&operator()).await.unwrap();
    fx.engine
        .stage_set(&operator(), &tx, &key("a"), EntryValue::Plain(json!(2)), Some(1))
        .await
        .unwrap();
    fx.engine
        .stage_set(&operator(), &tx, &key("b"), EntryValue::Plain(json!(2)), None)
        .await
        .unwrap();

    // Someone else moves "a" on before the commit.
    fx.engine
        .put(&operator(), &key("a"), EntryValue::Plain(json!(99)), WriteOptions::default())
        .await
        .unwrap();

    let err = fx.engine.commit(&operator(), &tx).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(fx.engine.store().get(&key("b"), None).await.is_err());
    assert_eq!(fx.engine.store().get(&key("a"), None).await.unwrap().number, 2);
}

/// Backend that fails chain writes while `failing` is set.
#[derive(Default)]
struct FaultyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    async fn load_chains(&self) -> strongbox_store::Result<Vec<ChainRecord>> {
        self.inner.load_chains().await
    }

    async fn write_chains(&self, records: &[ChainRecord]) -> strongbox_store::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk unplugged".into()));
        }
        self.inner.write_chains(records).await
    }

    async fn remove_chains(&self, keys: &[EntryKey]) -> strongbox_store::Result<()> {
        self.inner.remove_chains(keys).await
    }

    async fn load_tenants(&self) -> strongbox_store::Result<Vec<TenantRecord>> {
        self.inner.load_tenants().await
    }

    async fn save_tenant(&self, record: &TenantRecord) -> strongbox_store::Result<()> {
        self.inner.save_tenant(record).await
    }

    async fn remove_tenant(&self, tenant: &TenantId) -> strongbox_store::Result<()> {
        self.inner.remove_tenant(tenant).await
    }
}

#[tokio::test]
async fn test_backend_fault_mid_commit_is_all_or_nothing() {
    let backend = Arc::new(FaultyBackend::default());
    let fx = Fixture::with(|b| b.storage_backend(backend.clone())).await;

    let tx = fx.engine.begin_transaction(&operator()).await.unwrap();
    for name in ["db.host", "db.port", "db.password"] {
        let value = if name == "db.password" {
            EntryValue::secret("correct-horse-battery")
        } else {
            EntryValue::Plain(json!(name))
        };
        fx.engine.stage_set(&operator(), &tx, &key(name), value, None).await.unwrap();
    }

    backend.failing.store(true, Ordering::SeqCst);
    let err = fx.engine.commit(&operator(), &tx).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)), "got {err:?}");
    for name in ["db.host", "db.port", "db.password"] {
        assert!(fx.engine.store().get(&key(name), None).await.is_err());
    }

    // The failed attempt is on record.
    fx.engine.ledger().flush().await.unwrap();
    let failures: Vec<_> = fx
        .engine
        .query_audit_log(
            &operator(),
            AuditFilter::new().outcome(AuditOutcome::Failure),
            TimeRange::all(),
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert!(!failures.is_empty());

    // Version numbers were not consumed by the failed commit.
    backend.failing.store(false, Ordering::SeqCst);
    let tx = fx.engine.begin_transaction(&operator()).await.unwrap();
    fx.engine
        .stage_set(&operator(), &tx, &key("db.host"), EntryValue::Plain(json!("db-1")), None)
        .await
        .unwrap();
    let written = fx.engine.commit(&operator(), &tx).await.unwrap();
    assert_eq!(written[0].version.number, 1);
}

#[tokio::test]
async fn test_cached_reads_follow_writes() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.cache.max_propagation_ms = 200;
    let shared = Arc::new(InMemorySharedCache::new());
    let engine = Engine::builder(config)
        .key_service(Arc::new(LocalKeyService::new(MasterKey::generate())))
        .shared_cache(shared.clone())
        .build()
        .await
        .unwrap();
    engine
        .provision_tenant(&operator(), tenant(), TenantQuotas::default())
        .await
        .unwrap();

    let key = key("timeout.ms");
    engine
        .put(&operator(), &key, EntryValue::Plain(json!(100)), WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.get(&operator(), &key, None).await.unwrap().value, EntryValue::Plain(json!(100)));
    assert_eq!(engine.get(&operator(), &key, None).await.unwrap().value, EntryValue::Plain(json!(100)));
    assert!(engine.cache_stats().l1.hits >= 1);

    engine
        .put(&operator(), &key, EntryValue::Plain(json!(250)), WriteOptions::default())
        .await
        .unwrap();

    // Within the propagation bound the new value is visible.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let seen = engine.get(&operator(), &key, None).await.unwrap();
        if seen.value == EntryValue::Plain(json!(250)) {
            assert_eq!(seen.version.number, 2);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stale value past the propagation bound");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Pinned versions are immutable and stay readable.
    let v1 = engine.get(&operator(), &key, Some(1)).await.unwrap();
    assert_eq!(v1.value, EntryValue::Plain(json!(100)));

    engine.shutdown().await;
}
