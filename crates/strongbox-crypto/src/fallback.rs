//! Fallback chain over several key services.

use async_trait::async_trait;
use std::sync::Arc;
use strongbox_core::{SecretBytes, TenantId};
use tracing::warn;

use crate::error::{CryptoError, Result};
use crate::kms::KeyService;
use crate::types::WrappedKey;

/// Tries providers in order for wrap and random generation; routes unwrap to
/// the provider that issued the KEK.
pub struct FallbackKeyService {
    providers: Vec<Arc<dyn KeyService>>,
}

impl FallbackKeyService {
    /// Create a chain. The first provider is preferred.
    pub fn new(providers: Vec<Arc<dyn KeyService>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(CryptoError::InvalidInput(
                "fallback chain needs at least one provider".to_string(),
            ));
        }
        Ok(Self { providers })
    }

    /// Number of providers in the chain.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Always false; construction rejects an empty chain.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl KeyService for FallbackKeyService {
    fn id(&self) -> &str {
        "fallback"
    }

    async fn wrap_key(&self, tenant: &TenantId, plaintext: &SecretBytes) -> Result<WrappedKey> {
        let mut last_err = None;
        for provider in &self.providers {
            match provider.wrap_key(tenant, plaintext).await {
                Ok(wrapped) => return Ok(wrapped),
                Err(err) => {
                    warn!(provider = provider.id(), error = %err, "wrap failed, trying next provider");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CryptoError::Unavailable("no providers".to_string())))
    }

    async fn unwrap_key(&self, tenant: &TenantId, wrapped: &WrappedKey) -> Result<SecretBytes> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.owns(&wrapped.kek_id))
            .ok_or_else(|| {
                CryptoError::KeyService(format!("no provider owns KEK {}", wrapped.kek_id))
            })?;
        provider.unwrap_key(tenant, wrapped).await
    }

    async fn generate_random(&self, n: usize) -> Result<Vec<u8>> {
        let mut last_err = None;
        for provider in &self.providers {
            match provider.generate_random(n).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| CryptoError::Unavailable("no providers".to_string())))
    }

    /// Destroys the tenant KEK in every provider; fails if any provider fails.
    async fn destroy_key(&self, tenant: &TenantId) -> Result<()> {
        for provider in &self.providers {
            provider.destroy_key(tenant).await?;
        }
        Ok(())
    }

    fn owns(&self, kek_id: &strongbox_core::KekId) -> bool {
        self.providers.iter().any(|p| p.owns(kek_id))
    }
}
