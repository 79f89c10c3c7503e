//! Alert configuration types

use serde::{Deserialize, Serialize};

/// Default subscribe reaction
pub const DEFAULT_EMOJI: &str = "🔔";

/// Consecutive-tick thresholds for the alert state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Consecutive Down ticks before an entity is declared down
    pub down: u32,
    /// Consecutive Healthy ticks before an alerted entity is declared recovered
    pub up: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { down: 2, up: 3 }
    }
}

/// Where alerts are posted and who gets pinged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertChannelConfig {
    /// Platform channel id
    pub channel_id: String,
    /// Role mentioned on alerts and granted to subscribers
    #[serde(default)]
    pub mention_role_id: Option<String>,
    /// Reaction emoji that subscribes
    #[serde(default)]
    pub emoji: Option<String>,
    /// Message whose reactions toggle subscription
    #[serde(default)]
    pub subscribe_message_id: Option<String>,
    /// Entities routed to this channel; `None` routes all of them
    #[serde(default)]
    pub entities: Option<Vec<String>>,
}

impl AlertChannelConfig {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            mention_role_id: None,
            emoji: None,
            subscribe_message_id: None,
            entities: None,
        }
    }

    pub fn with_mention_role(mut self, role_id: impl Into<String>) -> Self {
        self.mention_role_id = Some(role_id.into());
        self
    }

    pub fn with_emoji(mut self, emoji: impl Into<String>) -> Self {
        self.emoji = Some(emoji.into());
        self
    }

    pub fn with_subscribe_message(mut self, message_id: impl Into<String>) -> Self {
        self.subscribe_message_id = Some(message_id.into());
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = Some(entities.into_iter().map(Into::into).collect());
        self
    }

    /// Whether transitions of `entity_id` are posted here
    pub fn routes(&self, entity_id: &str) -> bool {
        match &self.entities {
            Some(list) => list.iter().any(|e| e == entity_id),
            None => true,
        }
    }

    pub fn emoji(&self) -> &str {
        self.emoji
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(DEFAULT_EMOJI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_builder() {
        let channel = AlertChannelConfig::new("100")
            .with_mention_role("200")
            .with_subscribe_message("300")
            .with_entities(["asha", "soji"]);

        assert_eq!(channel.mention_role_id.as_deref(), Some("200"));
        assert!(channel.routes("asha"));
        assert!(!channel.routes("api"));
        assert_eq!(channel.emoji(), DEFAULT_EMOJI);
    }

    #[test]
    fn test_unfiltered_channel_routes_everything() {
        let channel = AlertChannelConfig::new("100").with_emoji("🚨");
        assert!(channel.routes("api"));
        assert!(channel.routes("mythomax"));
        assert_eq!(channel.emoji(), "🚨");
    }

    #[test]
    fn test_deserialize_minimal() {
        let channel: AlertChannelConfig =
            serde_json::from_str(r#"{"channel_id": "42"}"#).unwrap();
        assert_eq!(channel, AlertChannelConfig::new("42"));
    }
}
