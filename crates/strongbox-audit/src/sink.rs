//! Audit sinks: where sealed records are persisted.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::{AuditError, Result};
use crate::record::AuditRecord;

/// Append-only record storage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    /// Durably append one record.
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    /// Every record, in ledger order.
    async fn load(&self) -> Result<Vec<AuditRecord>>;
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.records.lock().clone())
    }
}

/// JSON-lines file sink. One record per line, file mode 0600.
pub struct FileAuditSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<tokio::fs::File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        Ok(options.open(&self.path).await?)
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(AuditError::sink("audit file not open"));
        };

        let written = async {
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(err) = written {
            // Reopen on the next attempt.
            *guard = None;
            return Err(err.into());
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<AuditRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(line).map_err(|e| AuditError::Integrity {
                sequence: idx as u64 + 1,
                reason: format!("unparseable ledger line: {e}"),
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GENESIS_HASH;
    use chrono::Utc;
    use strongbox_core::{ActorId, AuditAction, AuditEvent, AuditOutcome};

    fn record(seq: u64, prev: &str) -> AuditRecord {
        let event = AuditEvent::new(
            ActorId::new("alice"),
            "acme:app/k",
            AuditAction::ConfigDeleted { version: seq },
            AuditOutcome::Success,
        );
        AuditRecord::seal(event, seq, Utc::now(), prev)
    }

    #[tokio::test]
    async fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("audit/ledger.jsonl"));

        let first = record(1, GENESIS_HASH);
        let second = record(2, &first.hash);
        sink.append(&first).await.unwrap();
        sink.append(&second).await.unwrap();

        let loaded = sink.load().await.unwrap();
        assert_eq!(loaded, vec![first, second]);

        let raw = tokio::fs::read_to_string(sink.path()).await.unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_sink_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("ledger.jsonl"));
        sink.append(&record(1, GENESIS_HASH)).await.unwrap();

        let mode = std::fs::metadata(sink.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("none.jsonl"));
        assert!(sink.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_line_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        tokio::fs::write(&path, "{not json}\n").await.unwrap();
        let sink = FileAuditSink::new(&path);
        assert!(matches!(sink.load().await, Err(AuditError::Integrity { sequence: 1, .. })));
    }
}
