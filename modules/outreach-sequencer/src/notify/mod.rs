//! Scheduler notifications: an enrollment paused for credit or retries, or
//! left the active state for good.

pub mod memory;
pub mod noop;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use outreach_common::{Enrollment, EnrollmentReason, EnrollmentStatus};

use crate::journal::{self, EventLike, Journal};

pub use memory::MemoryBackend;
pub use noop::NoopBackend;
pub use webhook::WebhookBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    CreditExhausted,
    MaxRetriesExceeded { last_error: String },
    EnrollmentCancelled { reason: EnrollmentReason },
    EnrollmentCompleted { reason: EnrollmentReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub enrollment_id: Uuid,
    pub lead_id: Uuid,
    pub company_id: Uuid,
    #[serde(flatten)]
    pub kind: NotificationKind,
    pub at: DateTime<Utc>,
}

impl Notification {
    /// The notification an enrollment's current state calls for, if any.
    pub fn for_enrollment(enrollment: &Enrollment, at: DateTime<Utc>) -> Option<Self> {
        let reason = enrollment.reason.clone()?;
        let kind = match (enrollment.status, reason) {
            (EnrollmentStatus::Paused, EnrollmentReason::CreditExhausted) => {
                NotificationKind::CreditExhausted
            }
            (EnrollmentStatus::Paused, EnrollmentReason::MaxRetriesExceeded { last_error }) => {
                NotificationKind::MaxRetriesExceeded { last_error }
            }
            (EnrollmentStatus::Cancelled, reason) => NotificationKind::EnrollmentCancelled { reason },
            (EnrollmentStatus::Completed, reason) => NotificationKind::EnrollmentCompleted { reason },
            _ => return None,
        };

        Some(Self {
            enrollment_id: enrollment.id,
            lead_id: enrollment.lead_id,
            company_id: enrollment.company_id,
            kind,
            at,
        })
    }

    pub fn code(&self) -> &'static str {
        match self.kind {
            NotificationKind::CreditExhausted => "credit-exhausted",
            NotificationKind::MaxRetriesExceeded { .. } => "max-retries-exceeded",
            NotificationKind::EnrollmentCancelled { .. } => "enrollment-cancelled",
            NotificationKind::EnrollmentCompleted { .. } => "enrollment-completed",
        }
    }

    /// One-line human summary for chat-style backends.
    pub fn summary(&self) -> String {
        match &self.kind {
            NotificationKind::CreditExhausted => format!(
                "Enrollment {} paused: company {} is out of credits",
                self.enrollment_id, self.company_id
            ),
            NotificationKind::MaxRetriesExceeded { last_error } => format!(
                "Enrollment {} paused after repeated failures: {last_error}",
                self.enrollment_id
            ),
            NotificationKind::EnrollmentCancelled { reason } => {
                format!("Enrollment {} cancelled ({reason})", self.enrollment_id)
            }
            NotificationKind::EnrollmentCompleted { reason } => {
                format!("Enrollment {} completed ({reason})", self.enrollment_id)
            }
        }
    }
}

impl EventLike for Notification {
    fn event_type_str(&self) -> String {
        format!("notification.{}", self.code())
    }

    fn subject_id(&self) -> Option<Uuid> {
        Some(self.enrollment_id)
    }
}

/// Pluggable delivery of notifications.
#[async_trait]
pub trait NotifyBackend: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Journals each notification, then hands it to the backend. Failures are
/// logged and swallowed; a notification never fails the transition that
/// produced it.
#[derive(Clone)]
pub struct Notifier {
    backend: Arc<dyn NotifyBackend>,
    journal: Arc<dyn Journal>,
}

impl Notifier {
    pub fn new(backend: Arc<dyn NotifyBackend>, journal: Arc<dyn Journal>) -> Self {
        Self { backend, journal }
    }

    pub async fn notify(&self, notification: Notification) {
        if let Err(e) = journal::record(self.journal.as_ref(), &notification, "scheduler").await {
            warn!(
                error = %e,
                enrollment_id = %notification.enrollment_id,
                kind = notification.code(),
                "Failed to journal notification"
            );
        }
        if let Err(e) = self.backend.send(&notification).await {
            warn!(
                error = %e,
                enrollment_id = %notification.enrollment_id,
                kind = notification.code(),
                "Failed to send notification"
            );
        }
    }

    /// Notify about `enrollment` if its state calls for it.
    pub async fn notify_enrollment(&self, enrollment: &Enrollment, at: DateTime<Utc>) {
        if let Some(notification) = Notification::for_enrollment(enrollment, at) {
            self.notify(notification).await;
        }
    }
}
