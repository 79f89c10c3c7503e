pub mod entity;
pub mod tick;

pub use entity::{default_entities, EntityKind, MonitoredEntity, API_ENTITY_ID, DEFAULT_MODELS};
pub use tick::{Health, StatusTick, TickMetrics};
