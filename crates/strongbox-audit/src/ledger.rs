//! The audit ledger.
//!
//! Two write paths share one hash chain:
//!
//! - [`AuditLedger::record`] is synchronous and fail-closed. Callers that
//!   mutate secret or access state must not proceed when it errors.
//! - [`AuditLedger::record_informational`] enqueues onto a bounded channel
//!   drained by a background worker. Failures there are retried, counted, and
//!   escalated to an operator alert once they persist.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use strongbox_core::clock::{self, Clock, SharedClock};
use strongbox_core::config::AuditConfig;
use strongbox_core::notify::{Notification, Notifier, NullNotifier};
use strongbox_core::retry::retry_with_timeout;
use strongbox_core::AuditEvent;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{AuditError, Result};
use crate::filter::{AuditFilter, TimeRange};
use crate::record::{verify_records, AuditRecord, GENESIS_HASH};
use crate::sink::AuditSink;

enum QueueItem {
    Event(AuditEvent),
    Flush(oneshot::Sender<()>),
}

struct ChainHead {
    sequence: u64,
    hash: String,
}

/// Ledger counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub appended: u64,
    pub sync_failures: u64,
    pub buffered_failures: u64,
    pub dropped: u64,
    pub halted: bool,
}

struct LedgerInner {
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    head: Mutex<ChainHead>,
    halted: RwLock<Option<String>>,
    appended: AtomicU64,
    sync_failures: AtomicU64,
    buffered_failures: AtomicU64,
    dropped: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl LedgerInner {
    fn ensure_running(&self) -> Result<()> {
        match self.halted.read().as_ref() {
            Some(reason) => Err(AuditError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    async fn append(&self, event: AuditEvent) -> Result<AuditRecord> {
        self.ensure_running()?;
        let mut head = self.head.lock().await;
        let record = AuditRecord::seal(event, head.sequence + 1, self.clock.now(), &head.hash);

        let sink = self.sink.clone();
        let sealed = &record;
        retry_with_timeout(
            &self.config.write_retry,
            self.config.write_timeout(),
            "audit_append",
            || {
                let sink = sink.clone();
                async move { sink.append(sealed).await }
            },
        )
        .await?;

        head.sequence = record.sequence;
        head.hash = record.hash.clone();
        self.appended.fetch_add(1, Ordering::Relaxed);
        debug!(sequence = record.sequence, action = record.action.name(), "audit record appended");
        Ok(record)
    }

    async fn halt(&self, reason: String) {
        error!(reason = %reason, "audit ledger halted");
        *self.halted.write() = Some(reason.clone());
        self.notifier
            .notify(Notification::alert("audit.integrity", self.sink.name(), reason))
            .await;
    }

    /// Count a buffered-path failure and alert once the streak reaches the
    /// configured threshold.
    async fn buffered_failure(&self, reason: &str) {
        self.buffered_failures.fetch_add(1, Ordering::Relaxed);
        let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(streak, reason, "buffered audit write failed");
        if streak == self.config.alert_after_failures.max(1) {
            error!(streak, "buffered audit writes failing persistently");
            self.notifier
                .notify(Notification::alert(
                    "audit.degraded",
                    self.sink.name(),
                    format!("{streak} consecutive buffered audit writes failed: {reason}"),
                ))
                .await;
        }
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<QueueItem>) {
        while let Some(item) = rx.recv().await {
            match item {
                QueueItem::Event(event) => match self.append(event).await {
                    Ok(_) => self.consecutive_failures.store(0, Ordering::Relaxed),
                    Err(err) => self.buffered_failure(&err.to_string()).await,
                },
                QueueItem::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("audit worker stopped");
    }
}

/// Builder for [`AuditLedger`].
pub struct LedgerBuilder {
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
}

impl LedgerBuilder {
    pub fn new(sink: Arc<dyn AuditSink>, config: AuditConfig) -> Self {
        Self {
            sink,
            config,
            notifier: Arc::new(NullNotifier),
            clock: clock::system(),
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Load and verify the existing chain, then start the buffered worker.
    ///
    /// A chain that fails verification does not prevent opening; the ledger
    /// comes up halted and an alert is raised.
    pub async fn open(self) -> Result<AuditLedger> {
        let records = self.sink.load().await?;
        let verified = verify_records(&records);
        let head = match records.last() {
            Some(last) => ChainHead {
                sequence: last.sequence,
                hash: last.hash.clone(),
            },
            None => ChainHead {
                sequence: 0,
                hash: GENESIS_HASH.to_string(),
            },
        };

        let inner = Arc::new(LedgerInner {
            sink: self.sink,
            config: self.config,
            notifier: self.notifier,
            clock: self.clock,
            head: Mutex::new(head),
            halted: RwLock::new(None),
            appended: AtomicU64::new(0),
            sync_failures: AtomicU64::new(0),
            buffered_failures: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        });

        if let Err((sequence, reason)) = verified {
            inner
                .halt(format!("chain verification failed at record {sequence}: {reason}"))
                .await;
        } else {
            info!(records = records.len(), sink = inner.sink.name(), "audit ledger opened");
        }

        let (tx, rx) = mpsc::channel(inner.config.buffer_capacity.max(1));
        tokio::spawn(inner.clone().run_worker(rx));

        Ok(AuditLedger { inner, queue: tx })
    }
}

/// Append-only, hash-chained audit log.
pub struct AuditLedger {
    inner: Arc<LedgerInner>,
    queue: mpsc::Sender<QueueItem>,
}

impl AuditLedger {
    /// Seal and persist `event` before returning.
    ///
    /// Fails with the ledger unchanged if the sink cannot be written within
    /// the timeout and retry budget, or if the ledger is halted.
    pub async fn record(&self, event: AuditEvent) -> Result<AuditRecord> {
        match self.inner.append(event).await {
            Ok(record) => Ok(record),
            Err(err) => {
                self.inner.sync_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "synchronous audit write failed");
                Err(err)
            }
        }
    }

    /// Queue `event` for the background worker. Returns whether it was
    /// accepted.
    pub fn record_informational(&self, event: AuditEvent) -> bool {
        if !self.inner.config.record_reads && !event.is_mutating() {
            return false;
        }
        match self.queue.try_send(QueueItem::Event(event)) {
            Ok(()) => true,
            Err(err) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                let inner = self.inner.clone();
                let reason = format!("audit event dropped: {err}");
                tokio::spawn(async move { inner.buffered_failure(&reason).await });
                false
            }
        }
    }

    /// Wait until everything queued so far has been processed.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(QueueItem::Flush(tx))
            .await
            .map_err(|e| AuditError::Queue(e.to_string()))?;
        rx.await.map_err(|e| AuditError::Queue(e.to_string()))
    }

    /// Recompute the full chain from the sink.
    ///
    /// On mismatch the ledger halts, an alert is raised, and every later
    /// write fails.
    pub async fn verify_chain(&self) -> Result<u64> {
        let head = self.inner.head.lock().await;
        let records = self.inner.sink.load().await?;

        let mut outcome = verify_records(&records);
        if outcome.is_ok() {
            let last = records.last().map(|r| (r.sequence, r.hash.as_str()));
            let expected = (head.sequence, head.hash.as_str());
            if head.sequence > 0 && last != Some(expected) {
                outcome = Err((head.sequence, "ledger is missing records written by this process".into()));
            }
        }
        drop(head);

        match outcome {
            Ok(()) => {
                debug!(records = records.len(), "audit chain verified");
                Ok(records.len() as u64)
            }
            Err((sequence, reason)) => {
                self.inner
                    .halt(format!("chain verification failed at record {sequence}: {reason}"))
                    .await;
                Err(AuditError::Integrity { sequence, reason })
            }
        }
    }

    /// Records matching `filter` within `range`, oldest first.
    pub async fn query(&self, filter: AuditFilter, range: TimeRange) -> Result<BoxStream<'static, AuditRecord>> {
        let records = self.inner.sink.load().await?;
        Ok(stream::iter(records)
            .filter(move |r| {
                let keep = range.contains(r.timestamp) && filter.matches(r);
                async move { keep }
            })
            .boxed())
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.read().is_some()
    }

    /// Sequence number and hash of the newest record.
    pub async fn head(&self) -> (u64, String) {
        let head = self.inner.head.lock().await;
        (head.sequence, head.hash.clone())
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            appended: self.inner.appended.load(Ordering::Relaxed),
            sync_failures: self.inner.sync_failures.load(Ordering::Relaxed),
            buffered_failures: self.inner.buffered_failures.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            halted: self.is_halted(),
        }
    }
}
