//! The envelope crypto engine.

use std::sync::Arc;
use strongbox_core::config::CryptoConfig;
use strongbox_core::retry::retry_with_timeout;
use strongbox_core::{DataKeyId, SecretBytes, TenantId};
use tracing::{debug, warn};

use crate::cipher::{self, KEY_SIZE};
use crate::error::{CryptoError, Result};
use crate::kms::KeyService;
use crate::types::{Algorithm, EncryptedValue, WrappedKey};
use crate::usage::{KeyUsageRegistry, UsageCounter};

/// A plaintext data key together with its wrapped form.
///
/// The plaintext is zeroed when the `DataKey` is dropped.
pub struct DataKey {
    pub id: DataKeyId,
    pub tenant: TenantId,
    plaintext: SecretBytes,
    pub wrapped: WrappedKey,
    usage: Arc<UsageCounter>,
}

impl DataKey {
    /// Whether the key reached its retirement threshold and should not be
    /// used for further encryptions.
    pub fn needs_rotation(&self) -> bool {
        self.usage.needs_rotation()
    }

    /// Encryptions performed under this key.
    pub fn ops(&self) -> u64 {
        self.usage.ops()
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("kek_id", &self.wrapped.kek_id)
            .field("ops", &self.ops())
            .finish_non_exhaustive()
    }
}

/// Associated data binding a ciphertext to its tenant and data key.
fn associated_data(tenant: &TenantId, data_key_id: &DataKeyId) -> Vec<u8> {
    format!("strongbox:v1:{tenant}:{data_key_id}").into_bytes()
}

/// Stateless envelope encryption over a [`KeyService`].
#[derive(Clone)]
pub struct EnvelopeEngine {
    keys: Arc<dyn KeyService>,
    config: CryptoConfig,
}

impl EnvelopeEngine {
    pub fn new(keys: Arc<dyn KeyService>, config: CryptoConfig) -> Self {
        Self { keys, config }
    }

    /// The underlying key service.
    pub fn key_service(&self) -> &Arc<dyn KeyService> {
        &self.keys
    }

    /// Produce a fresh data key for `tenant`, wrapped by the tenant's KEK.
    pub async fn generate_data_key(&self, tenant: &TenantId, usage: &KeyUsageRegistry) -> Result<DataKey> {
        if usage.tenant() != tenant {
            return Err(CryptoError::InvalidInput(format!(
                "usage registry belongs to {}, not {tenant}",
                usage.tenant()
            )));
        }

        let plaintext = SecretBytes::new(self.generate_random(KEY_SIZE).await?);
        if plaintext.len() != KEY_SIZE {
            return Err(CryptoError::KeyService(format!(
                "key service returned {} random bytes, expected {KEY_SIZE}",
                plaintext.len()
            )));
        }

        let keys = self.keys.as_ref();
        let key_ref = &plaintext;
        let wrapped = retry_with_timeout(
            &self.config.kms_retry,
            self.config.kms_timeout(),
            "wrap_key",
            move || keys.wrap_key(tenant, key_ref),
        )
        .await?;

        let id = DataKeyId::generate();
        debug!(tenant = %tenant, data_key_id = %id, kek_id = %wrapped.kek_id, "generated data key");

        Ok(DataKey {
            usage: usage.counter(&id),
            id,
            tenant: tenant.clone(),
            plaintext,
            wrapped,
        })
    }

    /// Encrypt `plaintext` under `data_key`. Each call consumes one slot of
    /// the key's operation budget.
    pub fn encrypt_value(&self, plaintext: &[u8], data_key: &DataKey) -> Result<EncryptedValue> {
        let ordinal = data_key.usage.reserve(&data_key.id)?;
        if ordinal == self.config.rotate_after_ops {
            warn!(
                tenant = %data_key.tenant,
                data_key_id = %data_key.id,
                ops = ordinal,
                "data key reached rotation threshold"
            );
        }

        let aad = associated_data(&data_key.tenant, &data_key.id);
        let (nonce, ciphertext) = cipher::seal(&data_key.plaintext, plaintext, &aad)?;

        Ok(EncryptedValue {
            ciphertext,
            nonce: nonce.to_vec(),
            wrapped_data_key: data_key.wrapped.bytes.clone(),
            kek_id: data_key.wrapped.kek_id.clone(),
            data_key_id: data_key.id.clone(),
            algorithm: Algorithm::Aes256Gcm,
        })
    }

    /// Unwrap the data key and decrypt. Never yields partial plaintext.
    pub async fn decrypt_value(&self, value: &EncryptedValue, tenant: &TenantId) -> Result<SecretBytes> {
        let keys = self.keys.as_ref();
        let wrapped = value.wrapped_key();
        let wrapped_ref = &wrapped;
        let data_key = retry_with_timeout(
            &self.config.kms_retry,
            self.config.kms_timeout(),
            "unwrap_key",
            move || keys.unwrap_key(tenant, wrapped_ref),
        )
        .await?;

        let aad = associated_data(tenant, &value.data_key_id);
        cipher::open(&data_key, &value.nonce, &value.ciphertext, &aad)
    }

    /// One-shot encryption with a fresh, single-use data key.
    pub async fn seal(&self, tenant: &TenantId, usage: &KeyUsageRegistry, plaintext: &[u8]) -> Result<EncryptedValue> {
        let data_key = self.generate_data_key(tenant, usage).await?;
        let result = self.encrypt_value(plaintext, &data_key);
        usage.release(&data_key.id);
        result
    }

    /// Destroy the tenant's KEK. Values wrapped under it become unrecoverable.
    pub async fn destroy_tenant_key(&self, tenant: &TenantId) -> Result<()> {
        let keys = self.keys.as_ref();
        retry_with_timeout(
            &self.config.kms_retry,
            self.config.kms_timeout(),
            "destroy_key",
            move || keys.destroy_key(tenant),
        )
        .await
    }

    /// Random bytes from the key service, under the call budget.
    pub async fn generate_random(&self, n: usize) -> Result<Vec<u8>> {
        let keys = self.keys.as_ref();
        retry_with_timeout(
            &self.config.kms_retry,
            self.config.kms_timeout(),
            "generate_random",
            move || keys.generate_random(n),
        )
        .await
    }
}
