//! Key-management collaborator contract.

use async_trait::async_trait;
use std::sync::Arc;
use strongbox_core::{KekId, SecretBytes, TenantId};

use crate::error::Result;
use crate::types::WrappedKey;

/// A key-management service holding tenant key-encryption keys.
///
/// Implementations are selected at construction time and may be chained
/// with [`FallbackKeyService`](crate::FallbackKeyService). KEK IDs issued by
/// an implementation are prefixed with `"{id}:"` so a wrapped key can be
/// routed back to the service that produced it.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Stable identifier of this service, used as the KEK ID prefix.
    fn id(&self) -> &str;

    /// Wrap a plaintext data key under the tenant's KEK.
    async fn wrap_key(&self, tenant: &TenantId, plaintext: &SecretBytes) -> Result<WrappedKey>;

    /// Unwrap a data key. Fails for any other tenant's KEK.
    async fn unwrap_key(&self, tenant: &TenantId, wrapped: &WrappedKey) -> Result<SecretBytes>;

    /// Produce `n` bytes from a cryptographically secure source.
    async fn generate_random(&self, n: usize) -> Result<Vec<u8>>;

    /// Destroy the tenant's KEK. Everything wrapped under it becomes
    /// unrecoverable.
    async fn destroy_key(&self, tenant: &TenantId) -> Result<()>;

    /// Whether this service issued `kek_id`.
    fn owns(&self, kek_id: &KekId) -> bool {
        kek_id
            .as_str()
            .strip_prefix(self.id())
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

#[async_trait]
impl<T> KeyService for Arc<T>
where
    T: KeyService + ?Sized,
{
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn wrap_key(&self, tenant: &TenantId, plaintext: &SecretBytes) -> Result<WrappedKey> {
        (**self).wrap_key(tenant, plaintext).await
    }

    async fn unwrap_key(&self, tenant: &TenantId, wrapped: &WrappedKey) -> Result<SecretBytes> {
        (**self).unwrap_key(tenant, wrapped).await
    }

    async fn generate_random(&self, n: usize) -> Result<Vec<u8>> {
        (**self).generate_random(n).await
    }

    async fn destroy_key(&self, tenant: &TenantId) -> Result<()> {
        (**self).destroy_key(tenant).await
    }

    fn owns(&self, kek_id: &KekId) -> bool {
        (**self).owns(kek_id)
    }
}
