use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use super::{Messenger, PlatformError, RoleManager};

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Discord REST client for alert messages and subscriber roles
#[derive(Debug, Clone)]
pub struct DiscordClient {
    http_client: reqwest::Client,
    api_base: String,
    token: String,
    guild_id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

impl DiscordClient {
    pub fn new(token: impl Into<String>, guild_id: impl Into<String>) -> Result<Self, PlatformError> {
        Self::with_timeout(token, guild_id, Duration::from_secs(30))
    }

    pub fn with_timeout(
        token: impl Into<String>,
        guild_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            guild_id: guild_id.into(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    fn role_url(&self, user_id: &str, role_id: &str) -> String {
        format!(
            "{}/guilds/{}/members/{}/roles/{}",
            self.api_base, self.guild_id, user_id, role_id
        )
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, format!("{}: {}", what, body)))
    }
}

/// Map an HTTP failure status to a platform error
fn map_status(status: StatusCode, detail: String) -> PlatformError {
    match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => PlatformError::Permission(detail),
        StatusCode::NOT_FOUND => PlatformError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited(detail),
        other => PlatformError::Transport(format!("HTTP {}: {}", other, detail)),
    }
}

/// Prefix the role ping and restrict allowed mentions to that role
fn message_payload(content: &str, mention_role_id: Option<&str>) -> serde_json::Value {
    match mention_role_id {
        Some(role) => serde_json::json!({
            "content": format!("<@&{}> {}", role, content),
            "allowed_mentions": { "parse": [], "roles": [role] },
        }),
        None => serde_json::json!({
            "content": content,
            "allowed_mentions": { "parse": [] },
        }),
    }
}

#[async_trait]
impl Messenger for DiscordClient {
    async fn send(
        &self,
        channel_id: &str,
        content: &str,
        mention_role_id: Option<&str>,
    ) -> Result<String, PlatformError> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel_id);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&message_payload(content, mention_role_id))
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        let response = Self::check(response, "send message").await?;
        let created: CreatedMessage = response
            .json()
            .await
            .map_err(|e| PlatformError::Transport(format!("Invalid message response: {}", e)))?;

        tracing::debug!(channel_id = %channel_id, message_id = %created.id, "Message sent");
        Ok(created.id)
    }
}

#[async_trait]
impl RoleManager for DiscordClient {
    async fn grant_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError> {
        let response = self
            .http_client
            .put(self.role_url(user_id, role_id))
            .header("Authorization", self.auth_header())
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        Self::check(response, "grant role").await?;
        Ok(())
    }

    async fn revoke_role(&self, user_id: &str, role_id: &str) -> Result<(), PlatformError> {
        let response = self
            .http_client
            .delete(self.role_url(user_id, role_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        Self::check(response, "revoke role").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, "x".into()),
            PlatformError::Permission(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "x".into()),
            PlatformError::RateLimited(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, "x".into()),
            PlatformError::Transport(_)
        ));
    }

    #[test]
    fn test_payload_restricts_mentions() {
        let payload = message_payload("Asha is down", Some("42"));
        assert_eq!(payload["content"], "<@&42> Asha is down");
        assert_eq!(payload["allowed_mentions"]["roles"][0], "42");

        let payload = message_payload("Asha is down", None);
        assert_eq!(payload["content"], "Asha is down");
        assert!(payload["allowed_mentions"]["parse"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_role_url() {
        let client = DiscordClient::new("token", "g1")
            .unwrap()
            .with_api_base("http://localhost:9999/api/");
        assert_eq!(
            client.role_url("u1", "r1"),
            "http://localhost:9999/api/guilds/g1/members/u1/roles/r1"
        );
    }
}
