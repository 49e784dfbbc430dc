//! Local key service backed by a single master key.
//!
//! Per-tenant KEKs are derived from the master key with HKDF-SHA256, so no
//! per-tenant key material is ever stored. The master key is resolved in
//! priority order:
//! 1. `STRONGBOX_MASTER_KEY` environment variable (hex-encoded)
//! 2. A key file (hex-encoded, created with mode 0600 if missing)
//! 3. An ephemeral random key (development only; lost on restart)

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;
use strongbox_core::{env, KekId, SecretBytes, TenantId};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::{self, KEY_SIZE};
use crate::error::{CryptoError, Result};
use crate::kms::KeyService;
use crate::types::WrappedKey;

/// HKDF salt and info prefix used to domain-separate tenant KEKs.
const KEK_SALT: &[u8] = b"strongbox-kek-salt-v1";
const KEK_INFO: &str = "strongbox-kek-v1";

/// The root secret of a [`LocalKeyService`].
#[derive(Clone)]
pub struct MasterKey(SecretBytes);

impl MasterKey {
    /// Wrap raw key bytes. Must be exactly 32 bytes.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            return Err(CryptoError::MasterKey(format!(
                "master key must be exactly {KEY_SIZE} bytes, got {len}"
            )));
        }
        Ok(Self(SecretBytes::new(bytes)))
    }

    /// Decode a hex-encoded key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CryptoError::MasterKey(format!("invalid hex: {e}")))?;
        Self::from_bytes(bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(cipher::generate_key())
    }

    /// Read the key from `STRONGBOX_MASTER_KEY`, if set.
    pub fn from_env() -> Result<Option<Self>> {
        let name = env::var("MASTER_KEY");
        match env::get_var(&name) {
            Some(hex_key) => Self::from_hex(&Zeroizing::new(hex_key))
                .map(Some)
                .map_err(|e| CryptoError::MasterKey(format!("{name}: {e}"))),
            None => Ok(None),
        }
    }

    /// Load the key from `path`, creating it with mode 0600 if missing.
    pub async fn load_or_create_file(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path).await? {
            let content = Zeroizing::new(tokio::fs::read_to_string(path).await?);
            return Self::from_hex(&content);
        }

        info!(path = %path.display(), "generating new master key file");
        let key = Self::generate();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = Zeroizing::new(hex::encode(key.0.expose()));
        tokio::fs::write(path, encoded.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(path, perms).await?;
        }

        Ok(key)
    }

    /// Resolve the master key: environment, then key file, then ephemeral.
    pub async fn resolve(key_file: Option<&Path>) -> Result<Self> {
        if let Some(key) = Self::from_env()? {
            debug!("using master key from environment variable");
            return Ok(key);
        }
        if let Some(path) = key_file {
            debug!(path = %path.display(), "using master key file");
            return Self::load_or_create_file(path).await;
        }
        warn!(
            "no master key configured; using an ephemeral key. Set {} to persist encrypted data across restarts",
            env::var("MASTER_KEY")
        );
        Ok(Self::generate())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Key service deriving tenant KEKs from a local master key.
pub struct LocalKeyService {
    id: String,
    master: MasterKey,
    destroyed: RwLock<HashSet<TenantId>>,
}

impl LocalKeyService {
    /// Create a service with the default ID `local`.
    pub fn new(master: MasterKey) -> Self {
        Self::with_id("local", master)
    }

    /// Create a service with a custom ID (KEK prefix).
    pub fn with_id(id: impl Into<String>, master: MasterKey) -> Self {
        Self {
            id: id.into(),
            master,
            destroyed: RwLock::new(HashSet::new()),
        }
    }

    /// Build from config: env var, then `master_key_file`, then ephemeral.
    pub async fn from_config(config: &strongbox_core::config::CryptoConfig) -> Result<Self> {
        let master = MasterKey::resolve(config.master_key_file.as_deref()).await?;
        Ok(Self::new(master))
    }

    fn kek_id(&self, tenant: &TenantId) -> KekId {
        KekId::new(format!("{}:{}", self.id, tenant))
    }

    fn kek(&self, tenant: &TenantId) -> Result<SecretBytes> {
        if self.destroyed.read().contains(tenant) {
            return Err(CryptoError::KeyDestroyed(tenant.to_string()));
        }
        let info = format!("{KEK_INFO}:{tenant}");
        cipher::derive_key(self.master.0.expose(), KEK_SALT, info.as_bytes())
    }
}

#[async_trait]
impl KeyService for LocalKeyService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wrap_key(&self, tenant: &TenantId, plaintext: &SecretBytes) -> Result<WrappedKey> {
        let kek = self.kek(tenant)?;
        let bytes = cipher::seal_combined(&kek, plaintext.expose(), tenant.as_str().as_bytes())?;
        Ok(WrappedKey {
            kek_id: self.kek_id(tenant),
            bytes,
        })
    }

    async fn unwrap_key(&self, tenant: &TenantId, wrapped: &WrappedKey) -> Result<SecretBytes> {
        if !self.owns(&wrapped.kek_id) {
            return Err(CryptoError::KeyService(format!(
                "KEK {} was not issued by {}",
                wrapped.kek_id, self.id
            )));
        }
        if wrapped.kek_id != self.kek_id(tenant) {
            return Err(CryptoError::DecryptionFailed(format!(
                "KEK {} does not belong to tenant {tenant}",
                wrapped.kek_id
            )));
        }
        let kek = self.kek(tenant)?;
        cipher::open_combined(&kek, &wrapped.bytes, tenant.as_str().as_bytes())
    }

    async fn generate_random(&self, n: usize) -> Result<Vec<u8>> {
        Ok(cipher::random_bytes(n))
    }

    async fn destroy_key(&self, tenant: &TenantId) -> Result<()> {
        warn!(tenant = %tenant, kek_id = %self.kek_id(tenant), "destroying tenant KEK");
        self.destroyed.write().insert(tenant.clone());
        Ok(())
    }
}
