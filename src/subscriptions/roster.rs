//! Persisted per-channel subscriber record

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::platform::PlatformError;

/// A user subscribed to one alert channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub user_id: String,
    pub channel_id: String,
    pub subscribed_at: DateTime<Utc>,
}

/// Role call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleAction {
    Grant,
    Revoke,
}

impl RoleAction {
    fn for_membership(subscribed: bool) -> Self {
        if subscribed {
            RoleAction::Grant
        } else {
            RoleAction::Revoke
        }
    }
}

/// Left on a user once role retries are exhausted; cleared by a later success or by hand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleErrorFlag {
    pub action: RoleAction,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// What the registry knows about a user's role on the platform.
///
/// Survives unsubscribe so that the debounce still applies to a quick re-subscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSync {
    /// Role state after the last completed call; `None` if never touched
    pub granted: Option<bool>,
    /// Completion time of the last role call (the debounce reference)
    pub last_debounce_at: Option<DateTime<Utc>>,
    pub error: Option<RoleErrorFlag>,
    #[serde(skip)]
    pub in_flight: bool,
}

/// Result of asking whether a role call should run now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolePlan {
    /// Channel has no mention role
    NoRole,
    /// Platform role already matches membership
    InSync,
    /// A call for this user is still running
    InFlight,
    /// Last call completed within the cooldown
    Debounced,
    /// Run this call; the user is now marked in flight
    Call(RoleAction),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRoster {
    pub channel_id: String,
    #[serde(default)]
    pub subscribers: BTreeMap<String, Subscriber>,
    #[serde(default)]
    pub role_sync: BTreeMap<String, RoleSync>,
}

impl ChannelRoster {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Default::default()
        }
    }

    pub fn is_subscribed(&self, user_id: &str) -> bool {
        self.subscribers.contains_key(user_id)
    }

    /// Returns false if the user was already subscribed
    pub fn add(&mut self, user_id: &str, now: DateTime<Utc>) -> bool {
        if self.is_subscribed(user_id) {
            return false;
        }
        self.subscribers.insert(
            user_id.to_string(),
            Subscriber {
                user_id: user_id.to_string(),
                channel_id: self.channel_id.clone(),
                subscribed_at: now,
            },
        );
        true
    }

    /// Returns false if the user was not subscribed
    pub fn remove(&mut self, user_id: &str) -> bool {
        self.subscribers.remove(user_id).is_some()
    }

    /// Whether the platform role disagrees with membership
    pub fn needs_sync(&self, user_id: &str) -> bool {
        let subscribed = self.is_subscribed(user_id);
        match self.role_sync.get(user_id).and_then(|s| s.granted) {
            Some(granted) => granted != subscribed,
            // Never touched: only a subscriber needs a grant
            None => subscribed,
        }
    }

    pub fn has_error(&self, user_id: &str) -> bool {
        self.role_sync
            .get(user_id)
            .is_some_and(|s| s.error.is_some())
    }

    /// Users whose role should be brought in line with membership
    pub fn out_of_sync_users(&self) -> Vec<String> {
        let mut users: Vec<&String> = self
            .subscribers
            .keys()
            .chain(self.role_sync.keys())
            .collect();
        users.sort();
        users.dedup();

        users
            .into_iter()
            .filter(|u| self.needs_sync(u))
            .cloned()
            .collect()
    }

    /// Decide whether a role call for `user_id` may run at `now`
    pub fn plan_role_call(
        &mut self,
        user_id: &str,
        has_role: bool,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> RolePlan {
        if !has_role {
            return RolePlan::NoRole;
        }
        if !self.needs_sync(user_id) {
            return RolePlan::InSync;
        }

        let action = RoleAction::for_membership(self.is_subscribed(user_id));
        let sync = self.role_sync.entry(user_id.to_string()).or_default();

        if sync.in_flight {
            return RolePlan::InFlight;
        }
        if sync
            .last_debounce_at
            .is_some_and(|last| now.signed_duration_since(last) < cooldown)
        {
            return RolePlan::Debounced;
        }

        sync.in_flight = true;
        RolePlan::Call(action)
    }

    /// Record a successful role call
    pub fn complete(&mut self, user_id: &str, action: RoleAction, now: DateTime<Utc>) {
        let sync = self.role_sync.entry(user_id.to_string()).or_default();
        sync.granted = Some(action == RoleAction::Grant);
        sync.last_debounce_at = Some(now);
        sync.error = None;
        sync.in_flight = false;
    }

    /// Record a role call that exhausted its retries. Membership is untouched.
    pub fn fail(
        &mut self,
        user_id: &str,
        action: RoleAction,
        error: &PlatformError,
        attempts: u32,
        now: DateTime<Utc>,
    ) {
        let sync = self.role_sync.entry(user_id.to_string()).or_default();
        sync.last_debounce_at = Some(now);
        sync.in_flight = false;
        sync.error = Some(RoleErrorFlag {
            action,
            message: error.to_string(),
            attempts,
            at: now,
        });
    }

    /// Forget a call that never completed. Role state stays as last known.
    pub fn release(&mut self, user_id: &str) {
        if let Some(sync) = self.role_sync.get_mut(user_id) {
            sync.in_flight = false;
        }
    }

    /// Returns true if a flag was cleared
    pub fn clear_error(&mut self, user_id: &str) -> bool {
        self.role_sync
            .get_mut(user_id)
            .and_then(|s| s.error.take())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_add_remove_idempotent() {
        let mut roster = ChannelRoster::new("c1");
        assert!(roster.add("u1", t0()));
        assert!(!roster.add("u1", t0() + Duration::seconds(5)));
        assert_eq!(roster.subscribers["u1"].subscribed_at, t0());

        assert!(roster.remove("u1"));
        assert!(!roster.remove("u1"));
    }

    #[test]
    fn test_plan_grant_then_in_sync() {
        let mut roster = ChannelRoster::new("c1");
        let cooldown = Duration::seconds(30);
        roster.add("u1", t0());

        assert_eq!(
            roster.plan_role_call("u1", true, t0(), cooldown),
            RolePlan::Call(RoleAction::Grant)
        );
        assert_eq!(
            roster.plan_role_call("u1", true, t0(), cooldown),
            RolePlan::InFlight
        );

        roster.complete("u1", RoleAction::Grant, t0());
        assert_eq!(
            roster.plan_role_call("u1", true, t0(), cooldown),
            RolePlan::InSync
        );
    }

    #[test]
    fn test_release_allows_a_new_call() {
        let mut roster = ChannelRoster::new("c1");
        let cooldown = Duration::seconds(30);
        roster.add("u1", t0());

        assert!(matches!(
            roster.plan_role_call("u1", true, t0(), cooldown),
            RolePlan::Call(_)
        ));
        roster.release("u1");

        let sync = &roster.role_sync["u1"];
        assert!(!sync.in_flight);
        assert_eq!(sync.granted, None);
        assert_eq!(sync.last_debounce_at, None);
        assert_eq!(
            roster.plan_role_call("u1", true, t0(), cooldown),
            RolePlan::Call(RoleAction::Grant)
        );
    }

    #[test]
    fn test_plan_debounce_window() {
        let mut roster = ChannelRoster::new("c1");
        let cooldown = Duration::seconds(30);
        roster.add("u1", t0());
        roster.plan_role_call("u1", true, t0(), cooldown);
        roster.complete("u1", RoleAction::Grant, t0());

        roster.remove("u1");
        assert_eq!(
            roster.plan_role_call("u1", true, t0() + Duration::seconds(10), cooldown),
            RolePlan::Debounced
        );
        assert_eq!(
            roster.plan_role_call("u1", true, t0() + Duration::seconds(30), cooldown),
            RolePlan::Call(RoleAction::Revoke)
        );
    }

    #[test]
    fn test_untouched_non_member_needs_nothing() {
        let mut roster = ChannelRoster::new("c1");
        assert!(!roster.needs_sync("u1"));
        assert_eq!(
            roster.plan_role_call("u1", true, t0(), Duration::zero()),
            RolePlan::InSync
        );
        assert_eq!(
            roster.plan_role_call("u1", false, t0(), Duration::zero()),
            RolePlan::NoRole
        );
    }

    #[test]
    fn test_failure_sets_flag_but_keeps_membership() {
        let mut roster = ChannelRoster::new("c1");
        roster.add("u1", t0());
        roster.plan_role_call("u1", true, t0(), Duration::zero());
        roster.fail(
            "u1",
            RoleAction::Grant,
            &PlatformError::Permission("hierarchy".into()),
            4,
            t0(),
        );

        assert!(roster.is_subscribed("u1"));
        assert!(roster.has_error("u1"));
        assert_eq!(roster.out_of_sync_users(), vec!["u1".to_string()]);
        assert!(roster.clear_error("u1"));
        assert!(!roster.clear_error("u1"));
    }

    #[test]
    fn test_in_flight_not_persisted() {
        let mut roster = ChannelRoster::new("c1");
        roster.add("u1", t0());
        roster.plan_role_call("u1", true, t0(), Duration::zero());

        let json = serde_json::to_string(&roster).unwrap();
        let restored: ChannelRoster = serde_json::from_str(&json).unwrap();
        assert!(!restored.role_sync["u1"].in_flight);
        assert_eq!(restored.subscribers, roster.subscribers);
    }
}
