//! Recording fakes for platform collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{Messenger, PlatformError, RoleManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel_id: String,
    pub content: String,
    pub mention_role_id: Option<String>,
}

#[derive(Default)]
pub struct RecordingMessenger {
    pub sent: Mutex<Vec<SentMessage>>,
    failing_channels: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_channel(&self, channel_id: &str) {
        self.failing_channels.lock().insert(channel_id.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(
        &self,
        channel_id: &str,
        content: &str,
        mention_role_id: Option<&str>,
    ) -> Result<String, PlatformError> {
        if self.failing_channels.lock().contains(channel_id) {
            return Err(PlatformError::Transport(format!("{} unreachable", channel_id)));
        }

        self.sent.lock().push(SentMessage {
            channel_id: channel_id.to_string(),
            content: content.to_string(),
            mention_role_id: mention_role_id.map(str::to_string),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("msg-{}", id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOp {
    Grant,
    Revoke,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCall {
    pub op: RoleOp,
    pub user_id: String,
    pub role_id: String,
}

#[derive(Default)]
pub struct RecordingRoles {
    pub calls: Mutex<Vec<RoleCall>>,
    /// Number of upcoming calls that fail with `Permission`
    failing_calls: AtomicU32,
}

impl RecordingRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RoleCall> {
        self.calls.lock().clone()
    }

    fn record(&self, op: RoleOp, user_id: &str, role_id: &str) -> Result<(), PlatformError> {
        self.calls.lock().push(RoleCall {
            op,
            user_id: user_id.to_string(),
            role_id: role_id.to_string(),
        });

        let fail = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            Err(PlatformError::Permission("role above bot".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RoleManager for RecordingRoles {
    async fn grant_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError> {
        self.record(RoleOp::Grant, user_id, role_id)
    }

    async fn revoke_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError> {
        self.record(RoleOp::Revoke, user_id, role_id)
    }
}
