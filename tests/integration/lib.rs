//! Shared fixtures for the integration tests.

use std::sync::Arc;
use strongbox_core::retry::RetryPolicy;
use strongbox_core::{ActorId, Config, EntryKey, ManualClock, TenantId, TenantQuotas};
use strongbox_crypto::{LocalKeyService, MasterKey};
use strongbox_engine::{Engine, EngineBuilder};
use tempfile::TempDir;

pub const TENANT: &str = "acme";
pub const NAMESPACE: &str = "payments/prod";

/// Configuration rooted in `dir`, with single-attempt retries so fault
/// injection surfaces immediately.
pub fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.data_dir = Some(dir.path().join("data"));
    config.store.backend_retry = RetryPolicy::none();
    config.rotation.jobs_dir = Some(dir.path().join("jobs"));
    config.audit.log_path = Some(dir.path().join("audit.log"));
    config.audit.write_retry = RetryPolicy::none();
    config
}

pub fn key(name: &str) -> EntryKey {
    EntryKey::parse(TENANT, NAMESPACE, name).unwrap()
}

pub fn tenant() -> TenantId {
    TenantId::new(TENANT).unwrap()
}

pub fn operator() -> ActorId {
    ActorId::new("operator")
}

/// An engine on a manual clock with persistent state in a temp dir.
/// Background tasks are off; tests drive rotation with `Engine::tick`.
pub struct Fixture {
    pub engine: Engine,
    pub clock: ManualClock,
    pub dir: TempDir,
    pub master: Arc<LocalKeyService>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with(|b| b).await
    }

    pub async fn with(customize: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Self {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let master = Arc::new(LocalKeyService::new(MasterKey::generate()));

        let builder = Engine::builder(config_in(&dir))
            .key_service(master.clone())
            .clock(Arc::new(clock.clone()))
            .without_background_tasks();
        let engine = customize(builder).build().await.unwrap();
        engine
            .provision_tenant(&operator(), tenant(), TenantQuotas::default())
            .await
            .unwrap();

        Self {
            engine,
            clock,
            dir,
            master,
        }
    }
}
