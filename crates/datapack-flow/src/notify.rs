//! Notification sink for run lifecycle events and operator alerts.
//!
//! Delivery (email, chat, web notifications) is an external collaborator;
//! the engine only pushes structured notifications into a [`Notifier`].
//! The trait is intentionally synchronous so finalization paths can emit
//! without holding async state.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datapack_core::RunId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationVerb {
    /// A run was submitted and started.
    RunStarted,
    /// A run completed successfully.
    RunCompleted,
    /// A run settled incomplete (partial success).
    RunFailed,
    /// A run was cancelled.
    RunCancelled,
    /// A run was soft-deleted.
    RunDeleted,
    /// An archive failed assembly or verification.
    ArchiveFailed,
}

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    /// Informational.
    Info,
    /// Successful completion.
    Success,
    /// Degraded outcome.
    Warning,
    /// Failure.
    Error,
}

/// One notification addressed to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Receiving user.
    pub recipient: String,
    /// Run the notification concerns.
    pub run_id: RunId,
    /// What happened.
    pub verb: NotificationVerb,
    /// Severity.
    pub level: NotificationLevel,
    /// Short human-readable message.
    pub message: String,
    /// When the notification was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl Notification {
    /// Creates a notification.
    #[must_use]
    pub fn new(
        recipient: impl Into<String>,
        run_id: RunId,
        verb: NotificationVerb,
        level: NotificationLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            run_id,
            verb,
            level,
            message: message.into(),
            emitted_at: Utc::now(),
        }
    }
}

/// Sink for notifications and operator alerts.
pub trait Notifier: Send + Sync {
    /// Emits a user notification.
    fn notify(&self, notification: Notification);

    /// Raises an operator alert, separate from user-facing status.
    fn operator_alert(&self, subject: &str, body: &str);
}

/// Notifier that records everything in memory; used in tests.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    notifications: Mutex<Vec<Notification>>,
    alerts: Mutex<Vec<(String, String)>>,
}

impl InMemoryNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded notifications.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns all recorded operator alerts.
    #[must_use]
    pub fn alerts(&self) -> Vec<(String, String)> {
        self.alerts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(notification);
    }

    fn operator_alert(&self, subject: &str, body: &str) {
        self.alerts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((subject.to_string(), body.to_string()));
    }
}

/// Notifier that logs through `tracing`; the default in deployments where
/// delivery is wired up elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        tracing::info!(
            recipient = %notification.recipient,
            run_id = %notification.run_id,
            verb = ?notification.verb,
            level = ?notification.level,
            message = %notification.message,
            "notification"
        );
    }

    fn operator_alert(&self, subject: &str, body: &str) {
        tracing::error!(subject = subject, body = body, "operator alert");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_notifier_records() {
        let notifier = InMemoryNotifier::new();
        notifier.notify(Notification::new(
            "gis-user",
            RunId::generate(),
            NotificationVerb::RunCompleted,
            NotificationLevel::Success,
            "Your DataPack is ready.",
        ));
        notifier.operator_alert("archive corrupt", "run xyz");

        assert_eq!(notifier.notifications().len(), 1);
        assert_eq!(notifier.alerts().len(), 1);
    }
}
