//! Audit ledger integrity, fail-closed writes and tenant isolation.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strongbox_audit::{AuditError, AuditRecord, AuditSink, MemoryAuditSink};
use strongbox_core::{ActorId, Error, TenantId, TenantQuotas};
use strongbox_engine::{Grant, Scope, ScopedAuthorizer};
use strongbox_integration_tests::{config_in, key, operator, tenant, Fixture};
use strongbox_store::{EntryValue, VersionValue, WriteOptions};

#[tokio::test]
async fn test_flipped_record_is_detected_and_halts_writes() {
    let fx = Fixture::new().await;
    fx.engine
        .put(&operator(), &key("region"), EntryValue::Plain(json!("eu-west-1")), WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(fx.engine.verify_audit_chain(&operator()).await.unwrap(), 2);

    let path = fx.dir.path().join("audit.log");
    let content = std::fs::read_to_string(&path).unwrap();
    let tampered = content.replacen("eu-west-1", "eu-west-2", 1).replacen("tenant:acme", "tenant:acmf", 1);
    assert_ne!(content, tampered);
    std::fs::write(&path, tampered).unwrap();

    let err = fx.engine.verify_audit_chain(&operator()).await.unwrap_err();
    assert!(matches!(err, Error::Corrupted { .. }), "got {err:?}");
    assert!(fx.engine.ledger().is_halted());

    // Mutations need the ledger, so they stop too.
    let err = fx
        .engine
        .put(&operator(), &key("region"), EntryValue::Plain(json!("us-east-1")), WriteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuditWriteFailure(_)), "got {err:?}");
    assert_eq!(fx.engine.store().get(&key("region"), None).await.unwrap().number, 1);
}

#[tokio::test]
async fn test_tampered_ledger_halts_on_restart() {
    let fx = Fixture::new().await;
    fx.engine.ledger().flush().await.unwrap();
    fx.engine.shutdown().await;

    let path = fx.dir.path().join("audit.log");
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replacen("tenant_provisioned", "tenant_updated", 1)).unwrap();

    let engine = strongbox_engine::Engine::builder(config_in(&fx.dir))
        .key_service(fx.master.clone())
        .without_background_tasks()
        .build()
        .await
        .unwrap();
    assert!(engine.ledger().is_halted());
    assert!(engine
        .put(&operator(), &key("x"), EntryValue::Plain(json!(1)), WriteOptions::default())
        .await
        .is_err());
}

/// Sink that refuses appends while `down` is set.
#[derive(Default)]
struct OutageSink {
    inner: MemoryAuditSink,
    down: AtomicBool,
}

#[async_trait]
impl AuditSink for OutageSink {
    fn name(&self) -> &str {
        "outage"
    }

    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AuditError::sink("audit volume unavailable"));
        }
        self.inner.append(record).await
    }

    async fn load(&self) -> Result<Vec<AuditRecord>, AuditError> {
        self.inner.load().await
    }
}

#[tokio::test]
async fn test_audit_outage_blocks_mutations_but_not_reads() {
    let sink = Arc::new(OutageSink::default());
    let fx = Fixture::with(|b| b.audit_sink(sink.clone())).await;
    fx.engine
        .put(&operator(), &key("pool.size"), EntryValue::Plain(json!(10)), WriteOptions::default())
        .await
        .unwrap();

    sink.down.store(true, Ordering::SeqCst);
    let err = fx
        .engine
        .put(&operator(), &key("pool.size"), EntryValue::Plain(json!(20)), WriteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuditWriteFailure(_)), "got {err:?}");

    let current = fx.engine.get(&operator(), &key("pool.size"), None).await.unwrap();
    assert_eq!(current.value, EntryValue::Plain(json!(10)));
    assert_eq!(current.version.number, 1);

    sink.down.store(false, Ordering::SeqCst);
    let written = fx
        .engine
        .put(&operator(), &key("pool.size"), EntryValue::Plain(json!(20)), WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(written.number, 2);
}

#[tokio::test]
async fn test_ciphertext_does_not_open_under_another_tenant() {
    let fx = Fixture::new().await;
    let beta = TenantId::new("beta").unwrap();
    fx.engine
        .provision_tenant(&operator(), beta.clone(), TenantQuotas::default())
        .await
        .unwrap();
    fx.engine
        .put(&operator(), &key("signing.key"), EntryValue::secret("acme-only-signing-key"), WriteOptions::default())
        .await
        .unwrap();

    let stored = fx.engine.store().get(&key("signing.key"), None).await.unwrap();
    let VersionValue::Secret(sealed) = &stored.value else {
        panic!("secret stored in the clear");
    };
    assert!(fx.engine.store().crypto().decrypt_value(sealed, &beta).await.is_err());
    assert!(fx.engine.store().crypto().decrypt_value(sealed, &tenant()).await.is_ok());
}

#[tokio::test]
async fn test_tenant_scoped_grant_cannot_reach_other_tenants() {
    let authz = Arc::new(ScopedAuthorizer::new());
    authz.grant(operator(), Grant::admin());
    authz.grant(
        ActorId::new("acme-app"),
        Grant::new([Scope::Read, Scope::Write]).for_tenant(tenant()),
    );
    let fx = Fixture::with(|b| b.authorizer(authz.clone())).await;
    let beta = TenantId::new("beta").unwrap();
    fx.engine
        .provision_tenant(&operator(), beta, TenantQuotas::default())
        .await
        .unwrap();

    let app = ActorId::new("acme-app");
    fx.engine
        .put(&app, &key("own"), EntryValue::Plain(json!(true)), WriteOptions::default())
        .await
        .unwrap();

    let foreign = strongbox_core::EntryKey::parse("beta", "payments/prod", "own").unwrap();
    let err = fx
        .engine
        .put(&app, &foreign, EntryValue::Plain(json!(true)), WriteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationDenied(_)));
    assert!(fx.engine.get(&app, &foreign, None).await.is_err());
}
