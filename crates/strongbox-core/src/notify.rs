//! Best-effort notification sink.
//!
//! Operator alerts (corruption, sustained audit failure) and rotation
//! lifecycle events leave the engine through a [`Notifier`]. Delivery is
//! best-effort: a notifier never fails the operation that raised it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Alert,
}

/// A notification emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// When the event happened.
    pub at: DateTime<Utc>,

    /// Severity.
    pub level: NotificationLevel,

    /// Short event name, e.g. `rotation.completed`.
    pub event: String,

    /// Resource the event concerns.
    pub resource: String,

    /// Free-form message.
    pub message: String,
}

impl Notification {
    /// Create an informational notification.
    pub fn info(event: impl Into<String>, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, event, resource, message)
    }

    /// Create an operator alert.
    pub fn alert(event: impl Into<String>, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Alert, event, resource, message)
    }

    fn new(
        level: NotificationLevel,
        event: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now(),
            level,
            event: event.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Notification sink collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Must not block for long and must not fail.
    async fn notify(&self, notification: Notification);
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, notification: Notification) {
        debug!(event = %notification.event, resource = %notification.resource, "notification dropped");
    }
}

/// Notifier that keeps everything in memory. Useful in tests and for
/// embedding the engine without an external sink.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications seen so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    /// Notifications whose event name matches.
    pub fn events(&self, event: &str) -> Vec<Notification> {
        self.seen
            .lock()
            .iter()
            .filter(|n| n.event == event)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier
            .notify(Notification::alert("audit.halted", "ledger", "chain broken"))
            .await;
        notifier
            .notify(Notification::info("rotation.completed", "acme/db/password", "done"))
            .await;

        assert_eq!(notifier.notifications().len(), 2);
        let alerts = notifier.events("audit.halted");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, NotificationLevel::Alert);
    }
}
