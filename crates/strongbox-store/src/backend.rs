//! Storage backends.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use strongbox_core::{EntryKey, TenantId};
use tokio::sync::RwLock;
use tracing::debug;

use crate::chain::ChainRecord;
use crate::error::{Result, StoreError};
use crate::tenants::TenantRecord;

/// Durable storage for version chains and tenant records.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load every persisted chain.
    async fn load_chains(&self) -> Result<Vec<ChainRecord>>;

    /// Persist a batch of chains. Either every record becomes durable or the
    /// call fails and none of them replaces its previous state.
    async fn write_chains(&self, records: &[ChainRecord]) -> Result<()>;

    /// Physically remove chains.
    async fn remove_chains(&self, keys: &[EntryKey]) -> Result<()>;

    /// Load every tenant record.
    async fn load_tenants(&self) -> Result<Vec<TenantRecord>>;

    /// Create or replace a tenant record.
    async fn save_tenant(&self, record: &TenantRecord) -> Result<()>;

    /// Remove a tenant record.
    async fn remove_tenant(&self, tenant: &TenantId) -> Result<()>;
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    chains: RwLock<HashMap<EntryKey, ChainRecord>>,
    tenants: RwLock<HashMap<TenantId, TenantRecord>>,
}

impl MemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load_chains(&self) -> Result<Vec<ChainRecord>> {
        Ok(self.chains.read().await.values().cloned().collect())
    }

    async fn write_chains(&self, records: &[ChainRecord]) -> Result<()> {
        let mut chains = self.chains.write().await;
        for record in records {
            chains.insert(record.key.clone(), record.clone());
        }
        Ok(())
    }

    async fn remove_chains(&self, keys: &[EntryKey]) -> Result<()> {
        let mut chains = self.chains.write().await;
        for key in keys {
            chains.remove(key);
        }
        Ok(())
    }

    async fn load_tenants(&self) -> Result<Vec<TenantRecord>> {
        Ok(self.tenants.read().await.values().cloned().collect())
    }

    async fn save_tenant(&self, record: &TenantRecord) -> Result<()> {
        self.tenants
            .write()
            .await
            .insert(record.tenant.id.clone(), record.clone());
        Ok(())
    }

    async fn remove_tenant(&self, tenant: &TenantId) -> Result<()> {
        self.tenants.write().await.remove(tenant);
        Ok(())
    }
}

/// File-backed storage: one JSON file per chain and per tenant.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written chain. Files are created with mode 0600.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn chains_dir(&self) -> PathBuf {
        self.root.join("chains")
    }

    fn tenants_dir(&self) -> PathBuf {
        self.root.join("tenants")
    }

    fn chain_path(&self, key: &EntryKey) -> PathBuf {
        self.chains_dir().join(format!("{}.json", key.file_stem()))
    }

    fn tenant_path(&self, tenant: &TenantId) -> PathBuf {
        self.tenants_dir().join(format!("{tenant}.json"))
    }

    /// Ensure a directory exists with restrictive permissions.
    async fn ensure_dir(dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(dir, perms).await?;
        }

        Ok(())
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        if !tokio::fs::try_exists(dir).await? {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            let record = serde_json::from_slice(&content).map_err(|e| StoreError::Corrupted {
                scope: path.display().to_string(),
                reason: format!("unreadable record: {e}"),
            })?;
            out.push(record);
        }
        Ok(out)
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

/// Write `data` to `path` with mode 0600 on Unix.
pub(crate) async fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    tokio::fs::write(path, data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    Ok(())
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn load_chains(&self) -> Result<Vec<ChainRecord>> {
        Self::read_dir_json(&self.chains_dir()).await
    }

    async fn write_chains(&self, records: &[ChainRecord]) -> Result<()> {
        Self::ensure_dir(&self.chains_dir()).await?;

        // Stage every record first; nothing is visible until all are staged.
        let mut staged = Vec::with_capacity(records.len());
        for record in records {
            let path = self.chain_path(&record.key);
            let tmp = tmp_path(&path);
            let result = match serde_json::to_vec_pretty(record) {
                Ok(data) => write_private_file(&tmp, &data).await,
                Err(e) => Err(e.into()),
            };
            if let Err(err) = result {
                for (tmp, _) in &staged {
                    let _ = tokio::fs::remove_file(tmp).await;
                }
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err);
            }
            staged.push((tmp, path));
        }

        for (tmp, path) in staged {
            tokio::fs::rename(&tmp, &path).await?;
        }
        debug!(count = records.len(), "persisted chains");
        Ok(())
    }

    async fn remove_chains(&self, keys: &[EntryKey]) -> Result<()> {
        for key in keys {
            Self::remove_if_exists(&self.chain_path(key)).await?;
        }
        Ok(())
    }

    async fn load_tenants(&self) -> Result<Vec<TenantRecord>> {
        Self::read_dir_json(&self.tenants_dir()).await
    }

    async fn save_tenant(&self, record: &TenantRecord) -> Result<()> {
        Self::ensure_dir(&self.tenants_dir()).await?;
        let path = self.tenant_path(&record.tenant.id);
        let tmp = tmp_path(&path);
        write_private_file(&tmp, &serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_tenant(&self, tenant: &TenantId) -> Result<()> {
        Self::remove_if_exists(&self.tenant_path(tenant)).await
    }
}
