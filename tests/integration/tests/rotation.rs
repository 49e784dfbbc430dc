//! Secret rotation through the engine: grace windows, validation failures
//! and rollback after activation.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strongbox_core::{Clock, EntryKey, Error, SecretBytes};
use strongbox_engine::Engine;
use strongbox_integration_tests::{key, operator, Fixture};
use strongbox_lifecycle::{CredentialMatch, ErrorRateMonitor, FailureKind, RotationState, ValidationHook};
use strongbox_store::{EntryValue, WriteOptions};

const ORIGINAL: &str = "original-db-password-0001";

async fn seed(engine: &Engine, name: &str) -> EntryKey {
    let key = key(name);
    engine
        .put(&operator(), &key, EntryValue::secret(ORIGINAL), WriteOptions::default())
        .await
        .unwrap();
    key
}

async fn current_secret(engine: &Engine, key: &EntryKey) -> Vec<u8> {
    match engine.get(&operator(), key, None).await.unwrap().value {
        EntryValue::Secret(s) => s.expose().to_vec(),
        other => panic!("expected a secret, got {other:?}"),
    }
}

#[tokio::test]
async fn test_previous_secret_valid_for_ten_minute_grace() {
    let fx = Fixture::new().await;
    let key = seed(&fx.engine, "db.password").await;

    let job = fx.engine.trigger_emergency_rotation(&operator(), &key).await.unwrap();
    assert_eq!(job.state, RotationState::GracePeriod);
    let rotated = current_secret(&fx.engine, &key).await;
    assert_ne!(rotated, ORIGINAL.as_bytes());

    // Both values work inside the window.
    fx.clock.advance(Duration::minutes(5));
    assert_eq!(
        fx.engine.verify_secret(&operator(), &key, ORIGINAL.as_bytes()).await.unwrap(),
        CredentialMatch::Previous(1)
    );
    assert_eq!(
        fx.engine.verify_secret(&operator(), &key, &rotated).await.unwrap(),
        CredentialMatch::Current(2)
    );

    fx.clock.advance(Duration::minutes(4));
    fx.engine.tick().await;
    assert_eq!(
        fx.engine.get_rotation_status(&operator(), &key).await.unwrap().unwrap().state,
        RotationState::GracePeriod
    );

    // Past ten minutes with no recent use of the old value.
    fx.clock.advance(Duration::minutes(1) + Duration::seconds(1));
    fx.engine.tick().await;
    let status = fx.engine.get_rotation_status(&operator(), &key).await.unwrap().unwrap();
    assert_eq!(status.state, RotationState::Completed);

    let err = fx
        .engine
        .verify_secret(&operator(), &key, ORIGINAL.as_bytes())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationDenied(_)));
    assert_eq!(
        fx.engine.verify_secret(&operator(), &key, &rotated).await.unwrap(),
        CredentialMatch::Current(2)
    );
}

struct RejectAll;

#[async_trait]
impl ValidationHook for RejectAll {
    async fn validate(&self, _secret: &EntryKey, _candidate: &SecretBytes) -> Result<(), String> {
        Err("downstream refused the new credential".into())
    }
}

#[tokio::test]
async fn test_validation_failure_keeps_original_secret() {
    let fx = Fixture::with(|b| b.validator(Arc::new(RejectAll))).await;
    let key = seed(&fx.engine, "api.key").await;

    let err = fx.engine.trigger_emergency_rotation(&operator(), &key).await.unwrap_err();
    assert!(matches!(err, Error::RotationFailure(_)));

    let status = fx.engine.get_rotation_status(&operator(), &key).await.unwrap().unwrap();
    assert_eq!(status.state, RotationState::Failed);
    assert_eq!(status.failure.unwrap().kind, FailureKind::Validation);

    assert_eq!(current_secret(&fx.engine, &key).await, ORIGINAL.as_bytes());
    assert_eq!(fx.engine.list_versions(&operator(), &key).await.unwrap().len(), 1);
    assert_eq!(
        fx.engine.verify_secret(&operator(), &key, ORIGINAL.as_bytes()).await.unwrap(),
        CredentialMatch::Current(1)
    );
}

#[derive(Default)]
struct Flaky {
    failing: AtomicBool,
}

#[async_trait]
impl ErrorRateMonitor for Flaky {
    async fn error_rate(&self, _secret: &EntryKey) -> Option<f64> {
        self.failing.load(Ordering::SeqCst).then_some(0.4)
    }
}

#[tokio::test]
async fn test_error_spike_during_grace_rolls_back() {
    let monitor = Arc::new(Flaky::default());
    let fx = Fixture::with(|b| b.error_monitor(monitor.clone())).await;
    let key = seed(&fx.engine, "queue.token").await;

    fx.engine.trigger_emergency_rotation(&operator(), &key).await.unwrap();
    monitor.failing.store(true, Ordering::SeqCst);
    fx.clock.advance(Duration::seconds(30));
    fx.engine.tick().await;

    let status = fx.engine.get_rotation_status(&operator(), &key).await.unwrap().unwrap();
    assert_eq!(status.state, RotationState::RolledBack);
    assert_eq!(status.failure.unwrap().kind, FailureKind::ErrorRate);

    // The original value is current again, as a new version.
    assert_eq!(current_secret(&fx.engine, &key).await, ORIGINAL.as_bytes());
    assert_eq!(
        fx.engine.verify_secret(&operator(), &key, ORIGINAL.as_bytes()).await.unwrap(),
        CredentialMatch::Current(3)
    );
}

#[tokio::test]
async fn test_scheduled_rotation_can_be_cancelled() {
    let fx = Fixture::new().await;
    let key = seed(&fx.engine, "smtp.password").await;

    let at = fx.clock.now() + Duration::hours(1);
    fx.engine.schedule_rotation(&operator(), &key, at).await.unwrap();
    fx.engine.tick().await;
    assert_eq!(
        fx.engine.get_rotation_status(&operator(), &key).await.unwrap().unwrap().state,
        RotationState::Scheduled
    );

    let cancelled = fx.engine.cancel_rotation(&operator(), &key).await.unwrap();
    assert_eq!(cancelled.state, RotationState::Failed);
    assert_eq!(cancelled.failure.unwrap().kind, FailureKind::Cancelled);

    fx.clock.advance(Duration::hours(2));
    fx.engine.tick().await;
    assert_eq!(current_secret(&fx.engine, &key).await, ORIGINAL.as_bytes());
}
