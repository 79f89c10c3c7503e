//! Chat platform collaborators
//!
//! The monitor core only talks to the platform through [`Messenger`] and
//! [`RoleManager`]. [`DiscordClient`] implements both over the REST API; the `Log*`
//! variants stand in when no credentials are configured.

pub mod discord;
pub mod log;

#[cfg(test)]
pub(crate) mod testing;

pub use discord::DiscordClient;
pub use log::{LogMessenger, LogRoleManager};

use async_trait::async_trait;

/// Posts messages to platform channels
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send `content` to a channel, pinging `mention_role_id` if given.
    ///
    /// Returns the platform message id.
    async fn send(
        &self,
        channel_id: &str,
        content: &str,
        mention_role_id: Option<&str>,
    ) -> Result<String, PlatformError>;
}

/// Grants and revokes roles on platform users
#[async_trait]
pub trait RoleManager: Send + Sync {
    async fn grant_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError>;

    async fn revoke_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError>;
}

/// Platform call errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// Missing permission or role hierarchy violation
    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transport error: {0}")]
    Transport(String),
}
