//! Groups one cycle's transitions into per-channel notifications

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::config::AlertChannelConfig;
use super::state::{AlertTransition, Direction};
use crate::data::MonitoredEntity;
use crate::platform::{Messenger, PlatformError};

/// One grouped message, ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub direction: Direction,
    pub entity_ids: Vec<String>,
    pub content: String,
    pub mention_role_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Delivered {
    pub channel_id: String,
    pub direction: Direction,
    pub entity_ids: Vec<String>,
    pub message_id: String,
}

/// A grouped message the platform did not accept
#[derive(Debug, Clone, thiserror::Error)]
#[error("Delivery of {direction} to channel {channel_id} failed: {source}")]
pub struct DeliveryError {
    pub channel_id: String,
    pub direction: Direction,
    pub entity_ids: Vec<String>,
    pub source: PlatformError,
}

/// Outcome of one dispatch
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<Delivered>,
    pub failed: Vec<DeliveryError>,
}

impl DispatchReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Batches transitions by (channel, direction) and hands them to the messenger
pub struct NotificationDispatcher {
    channels: Vec<AlertChannelConfig>,
    /// Entity id to (config position, display name)
    entities: HashMap<String, (usize, String)>,
    messenger: Arc<dyn Messenger>,
}

impl NotificationDispatcher {
    pub fn new(
        entities: &[MonitoredEntity],
        channels: Vec<AlertChannelConfig>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let entities = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), (i, e.display_name.clone())))
            .collect();

        Self {
            channels,
            entities,
            messenger,
        }
    }

    /// Group transitions into at most one message per (channel, direction)
    pub fn plan(&self, transitions: &[AlertTransition], cycle_time: DateTime<Utc>) -> Vec<OutboundMessage> {
        let mut groups: BTreeMap<(usize, Direction), Vec<&str>> = BTreeMap::new();

        for transition in transitions {
            for (idx, channel) in self.channels.iter().enumerate() {
                if channel.routes(&transition.entity_id) {
                    let group = groups.entry((idx, transition.direction)).or_default();
                    if !group.contains(&transition.entity_id.as_str()) {
                        group.push(&transition.entity_id);
                    }
                }
            }
        }

        groups
            .into_iter()
            .map(|((idx, direction), mut entity_ids)| {
                let channel = &self.channels[idx];
                entity_ids.sort_by_key(|id| self.position(id));
                let names: Vec<&str> = entity_ids.iter().map(|id| self.display_name(id)).collect();

                OutboundMessage {
                    channel_id: channel.channel_id.clone(),
                    direction,
                    entity_ids: entity_ids.iter().map(|s| s.to_string()).collect(),
                    content: render(direction, &names, cycle_time),
                    mention_role_id: channel.mention_role_id.clone(),
                }
            })
            .collect()
    }

    /// Send one message per (channel, direction). Failures are reported, never retried here.
    pub async fn dispatch(
        &self,
        transitions: &[AlertTransition],
        cycle_time: DateTime<Utc>,
    ) -> DispatchReport {
        let messages = self.plan(transitions, cycle_time);
        if messages.is_empty() {
            return DispatchReport::default();
        }

        let sends = messages.iter().map(|m| {
            self.messenger
                .send(&m.channel_id, &m.content, m.mention_role_id.as_deref())
        });
        let results = futures::future::join_all(sends).await;

        let mut report = DispatchReport::default();
        for (message, result) in messages.into_iter().zip(results) {
            match result {
                Ok(message_id) => {
                    tracing::info!(
                        channel_id = %message.channel_id,
                        direction = %message.direction,
                        entities = ?message.entity_ids,
                        "Alert notification sent"
                    );
                    report.delivered.push(Delivered {
                        channel_id: message.channel_id,
                        direction: message.direction,
                        entity_ids: message.entity_ids,
                        message_id,
                    });
                }
                Err(e) => {
                    tracing::error!(
                        channel_id = %message.channel_id,
                        direction = %message.direction,
                        error = %e,
                        "Failed to send alert notification"
                    );
                    report.failed.push(DeliveryError {
                        channel_id: message.channel_id,
                        direction: message.direction,
                        entity_ids: message.entity_ids,
                        source: e,
                    });
                }
            }
        }

        report
    }

    fn position(&self, entity_id: &str) -> usize {
        self.entities
            .get(entity_id)
            .map(|(pos, _)| *pos)
            .unwrap_or(usize::MAX)
    }

    fn display_name<'a>(&'a self, entity_id: &'a str) -> &'a str {
        self.entities
            .get(entity_id)
            .map(|(_, name)| name.as_str())
            .unwrap_or(entity_id)
    }
}

/// "A", "A and B", "A, B and C"
fn join_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [one] => one.to_string(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

fn render(direction: Direction, names: &[&str], cycle_time: DateTime<Utc>) -> String {
    let subject = join_names(names);
    let plural = names.len() > 1;
    let when = cycle_time.format("%Y-%m-%d %H:%M UTC");

    match direction {
        Direction::WentDown => format!(
            "🔴 {} {} down (confirmed {}).",
            subject,
            if plural { "are" } else { "is" },
            when
        ),
        Direction::Recovered => format!(
            "🟢 {} {} recovered (confirmed {}).",
            subject,
            if plural { "have" } else { "has" },
            when
        ),
    }
}
