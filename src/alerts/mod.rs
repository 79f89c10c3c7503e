//! Hysteresis alerting
//!
//! Ticks are folded into a latched per-entity state machine; the transitions of one
//! poll cycle are grouped into a single notification per channel and direction.

pub mod config;
pub mod engine;
pub mod notifier;
pub mod state;

pub use config::{AlertChannelConfig, Thresholds, DEFAULT_EMOJI};
pub use engine::{AlertEngine, EngineError, StagedTick};
pub use notifier::{DeliveryError, DispatchReport, NotificationDispatcher, OutboundMessage};
pub use state::{AlertState, AlertStatus, AlertTransition, Direction};
