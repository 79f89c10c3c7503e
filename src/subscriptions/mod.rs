//! Alert channel subscriptions
//!
//! Membership changes are durable before they are acknowledged. The matching platform
//! role call is debounced per user and retried with backoff; a sweep brings roles back
//! in line once the cooldown passes.

pub mod registry;
pub mod roster;

pub use registry::{
    ReactionEvent, RegistryConfig, RegistryError, RoleOutcome, SubscriptionOutcome,
    SubscriptionRegistry,
};
pub use roster::{ChannelRoster, RoleAction, RoleErrorFlag, RolePlan, RoleSync, Subscriber};
