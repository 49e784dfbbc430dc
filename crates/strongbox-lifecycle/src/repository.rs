//! Durable storage for rotation jobs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use strongbox_core::JobId;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, RotationError};
use crate::job::RotationJob;

/// Persistence for rotation jobs. `save` must be durable before it returns.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn save(&self, job: &RotationJob) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<Option<RotationJob>>;

    async fn load_all(&self) -> Result<Vec<RotationJob>>;
}

/// In-memory repository.
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: RwLock<HashMap<JobId, RotationJob>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn save(&self, job: &RotationJob) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<RotationJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<RotationJob>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}

/// One JSON file per job, replaced atomically via a temporary file.
pub struct FileJobRepository {
    dir: PathBuf,
}

impl FileJobRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn job_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(&self.dir, perms).await?;
        }

        Ok(())
    }

    async fn read_job(path: &Path) -> Result<RotationJob> {
        let content = tokio::fs::read(path).await?;
        serde_json::from_slice(&content)
            .map_err(|e| RotationError::Repository(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl JobRepository for FileJobRepository {
    async fn save(&self, job: &RotationJob) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.job_path(&job.id);
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, serde_json::to_vec_pretty(job)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms).await?;
        }
        tokio::fs::rename(&tmp, &path).await?;

        debug!(job_id = %job.id, state = %job.state, "job saved");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<RotationJob>> {
        let path = self.job_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_job(&path).await.map(Some)
    }

    async fn load_all(&self) -> Result<Vec<RotationJob>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_job(&path).await {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}
