use async_trait::async_trait;

use super::{Notification, NotifyBackend};

/// Backend that drops every notification.
pub struct NoopBackend;

#[async_trait]
impl NotifyBackend for NoopBackend {
    async fn send(&self, _notification: &Notification) -> anyhow::Result<()> {
        Ok(())
    }
}
