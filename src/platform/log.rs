use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Messenger, PlatformError, RoleManager};

/// Writes alerts to the log instead of a chat channel
#[derive(Debug, Default)]
pub struct LogMessenger {
    next_id: AtomicU64,
}

impl LogMessenger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Messenger for LogMessenger {
    async fn send(
        &self,
        channel_id: &str,
        content: &str,
        mention_role_id: Option<&str>,
    ) -> Result<String, PlatformError> {
        tracing::warn!(
            channel_id = %channel_id,
            mention_role_id = ?mention_role_id,
            "Alert: {}",
            content
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("log-{}", id))
    }
}

/// Logs role changes without applying them
#[derive(Debug, Default)]
pub struct LogRoleManager;

#[async_trait]
impl RoleManager for LogRoleManager {
    async fn grant_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError> {
        tracing::info!(user_id = %user_id, role_id = %role_id, "Role grant (log only)");
        Ok(())
    }

    async fn revoke_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError> {
        tracing::info!(user_id = %user_id, role_id = %role_id, "Role revoke (log only)");
        Ok(())
    }
}
