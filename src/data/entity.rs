use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of monitored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// The upstream API as a whole
    Api,
    /// A single backing model
    Model,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Api => write!(f, "api"),
            EntityKind::Model => write!(f, "model"),
        }
    }
}

/// An entity whose health is tracked. Created from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredEntity {
    /// Stable identity, also the upstream field name for models
    pub id: String,
    /// Human-readable name used in notifications
    pub display_name: String,
    pub kind: EntityKind,
}

impl MonitoredEntity {
    pub fn api() -> Self {
        Self {
            id: API_ENTITY_ID.to_string(),
            display_name: "API".to_string(),
            kind: EntityKind::Api,
        }
    }

    pub fn model(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: capitalize(&id),
            id,
            kind: EntityKind::Model,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// Entity id reserved for the overall API status
pub const API_ENTITY_ID: &str = "api";

/// Models reported by the upstream status page, in its display order
pub const DEFAULT_MODELS: [&str; 6] = ["asha", "soji", "mobile", "mistral", "mixtral", "mythomax"];

/// The API entity followed by the default models
pub fn default_entities() -> Vec<MonitoredEntity> {
    std::iter::once(MonitoredEntity::api())
        .chain(DEFAULT_MODELS.iter().map(|m| MonitoredEntity::model(*m)))
        .collect()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
