//! Environment layering and tenant export through the engine.

use serde_json::json;
use strongbox_core::{ActorId, Environment, Error};
use strongbox_engine::{Grant, ScopedAuthorizer};
use strongbox_integration_tests::{key, operator, tenant, Fixture};
use strongbox_store::{EntryValue, WriteOptions};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_production_falls_back_through_staging_and_base() {
    let fx = Fixture::new().await;
    let pool = key("pool.size");
    for (env, size) in [(Environment::Base, 10), (Environment::Staging, 20)] {
        fx.engine
            .put(&operator(), &pool.in_environment(env), EntryValue::Plain(json!(size)), WriteOptions::default())
            .await
            .unwrap();
    }

    let prod = fx
        .engine
        .get_with_overrides(&operator(), &pool, Environment::Production)
        .await
        .unwrap();
    assert_eq!(prod.value, EntryValue::Plain(json!(20)));
    assert_eq!(prod.key.environment, Environment::Staging);

    // Edge only inherits from base.
    let edge = fx
        .engine
        .get_with_overrides(&operator(), &pool, Environment::Edge)
        .await
        .unwrap();
    assert_eq!(edge.value, EntryValue::Plain(json!(10)));
    assert!(edge.key.environment.is_base());

    fx.engine
        .put(
            &operator(),
            &pool.in_environment(Environment::Production),
            EntryValue::Plain(json!(40)),
            WriteOptions::default(),
        )
        .await
        .unwrap();
    let prod = fx
        .engine
        .get_with_overrides(&operator(), &pool, Environment::Production)
        .await
        .unwrap();
    assert_eq!(prod.value, EntryValue::Plain(json!(40)));

    // Plain reads address one layer exactly.
    let base = fx.engine.get(&operator(), &pool, None).await.unwrap();
    assert_eq!(base.value, EntryValue::Plain(json!(10)));
}

#[tokio::test]
async fn test_secret_override_is_revealed_from_its_layer() {
    let fx = Fixture::new().await;
    let token = key("api.token");
    fx.engine
        .put(&operator(), &token, EntryValue::secret("base-token-000000"), WriteOptions::default())
        .await
        .unwrap();
    fx.engine
        .put(
            &operator(),
            &token.in_environment(Environment::Development),
            EntryValue::secret("dev-token-0000000"),
            WriteOptions::default(),
        )
        .await
        .unwrap();

    let dev = fx
        .engine
        .get_with_overrides(&operator(), &token, Environment::Development)
        .await
        .unwrap();
    match dev.value {
        EntryValue::Secret(s) => assert_eq!(s.expose(), b"dev-token-0000000"),
        other => panic!("expected a secret, got {other:?}"),
    }

    let err = fx
        .engine
        .get_with_overrides(&operator(), &key("missing"), Environment::Production)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn test_export_keeps_secrets_sealed_and_is_audited() {
    let fx = Fixture::new().await;
    fx.engine
        .put(&operator(), &key("region"), EntryValue::Plain(json!("eu-west-1")), WriteOptions::default())
        .await
        .unwrap();
    fx.engine
        .put(&operator(), &key("db.password"), EntryValue::secret("hunter2-hunter2-hunter2"), WriteOptions::default())
        .await
        .unwrap();
    let before = fx.engine.verify_audit_chain(&operator()).await.unwrap();

    let out = TempDir::new().unwrap();
    let written = fx.engine.export_all(&operator(), &tenant(), out.path()).await.unwrap();
    assert_eq!(written, 2);

    let mut contents = String::new();
    for entry in std::fs::read_dir(out.path()).unwrap() {
        contents.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap());
    }
    assert!(contents.contains("eu-west-1"));
    assert!(!contents.contains("hunter2"));

    assert_eq!(fx.engine.verify_audit_chain(&operator()).await.unwrap(), before + 1);
}

#[tokio::test]
async fn test_export_needs_tenant_read_access() {
    let authz = Arc::new(ScopedAuthorizer::new());
    authz.grant(operator(), Grant::admin());
    let fx = Fixture::with(|b| b.authorizer(authz.clone())).await;

    let out = TempDir::new().unwrap();
    let stranger = ActorId::new("stranger");
    let err = fx.engine.export_all(&stranger, &tenant(), out.path()).await.unwrap_err();
    assert!(matches!(err, Error::AuthorizationDenied(_)), "got {err:?}");
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unknown_environment_name_is_rejected() {
    let err = "qa".parse::<Environment>().unwrap_err();
    assert!(err.to_string().contains("qa"));
    assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
}
