use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::{Notification, NotifyBackend};

/// Keeps every notification for later inspection.
#[derive(Default)]
pub struct MemoryBackend {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn codes_for(&self, enrollment_id: Uuid) -> Vec<&'static str> {
        self.sent()
            .iter()
            .filter(|n| n.enrollment_id == enrollment_id)
            .map(Notification::code)
            .collect()
    }
}

#[async_trait]
impl NotifyBackend for MemoryBackend {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }
}
