//! statuswatch: upstream health monitor with hysteresis alerting
//!
//! Polls a status document that reports the health of an API and its backing models,
//! keeps a bounded history per entity, and latches outages and recoveries through an
//! N-consecutive-tick state machine so a single noisy tick never pages anyone.
//!
//! # Features
//!
//! - **Bounded history**: fixed-depth rolling window per entity, persisted
//! - **Hysteresis alerts**: `down`/`up` thresholds with a neutral Warning value
//! - **Grouped notifications**: one message per channel and direction per cycle
//! - **Subscriptions**: reaction-driven, with debounced and retried role sync
//! - **Crash safety**: state is durable before a tick is acknowledged
//!
//! # Example
//!
//! ```no_run
//! use statuswatch::alerts::{AlertEngine, Thresholds};
//! use statuswatch::data::{default_entities, Health, StatusTick};
//! use chrono::Utc;
//!
//! let engine = AlertEngine::new(&default_entities(), Thresholds::default());
//!
//! let now = Utc::now();
//! engine.process(&StatusTick::new("asha", now, Health::Down)).unwrap();
//! let transition = engine
//!     .process(&StatusTick::new("asha", now + chrono::Duration::seconds(10), Health::Down))
//!     .unwrap();
//! println!("Transition: {:?}", transition);
//! ```

pub mod alerts;
pub mod api;
pub mod config;
pub mod data;
pub mod platform;
pub mod poller;
pub mod scheduler;
pub mod storage;
pub mod subscriptions;

// Re-export commonly used types
pub use alerts::{AlertEngine, AlertTransition, Direction, NotificationDispatcher};
pub use config::{ConfigError, MonitorConfig};
pub use data::{Health, MonitoredEntity, StatusTick};
pub use scheduler::Scheduler;
pub use storage::{HistoryStore, Store};
pub use subscriptions::SubscriptionRegistry;
