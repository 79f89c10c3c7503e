//! Channel subscriptions and their platform roles

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use super::roster::{ChannelRoster, RoleAction, RolePlan, RoleSync, Subscriber};
use crate::alerts::AlertChannelConfig;
use crate::platform::{PlatformError, RoleManager};
use crate::storage::{PersistenceError, Store};

/// Upper bound on a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Minimum gap between two role calls for one user
    pub cooldown: chrono::Duration,
    /// Retries after the first failed role call
    pub retry_max: u32,
    /// First backoff; doubles per retry
    pub backoff_base: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cooldown: chrono::Duration::seconds(30),
            retry_max: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// What happened to the platform role after a membership change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoleOutcome {
    NoRole,
    InSync,
    InFlight,
    /// Left for the reconcile sweep once the cooldown expires
    Debounced,
    Applied { action: RoleAction, attempts: u32 },
    Failed { action: RoleAction, attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionOutcome {
    pub channel_id: String,
    pub user_id: String,
    /// False when the call was a no-op on membership
    pub changed: bool,
    pub subscribed: bool,
    pub role: RoleOutcome,
}

/// Reaction add/remove on a message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReactionEvent {
    pub user_id: String,
    pub message_id: String,
    #[serde(default)]
    pub emoji: Option<String>,
    pub added: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown alert channel: {0}")]
    UnknownChannel(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Who is subscribed to which channel, with debounced role sync
pub struct SubscriptionRegistry {
    config: RegistryConfig,
    channels: HashMap<String, AlertChannelConfig>,
    /// Subscribe message id to channel id
    messages: HashMap<String, String>,
    rosters: DashMap<String, ChannelRoster>,
    roles: Arc<dyn RoleManager>,
    store: Store,
    running: Arc<AtomicBool>,
}

impl SubscriptionRegistry {
    pub fn new(
        channels: &[AlertChannelConfig],
        roles: Arc<dyn RoleManager>,
        store: Store,
        config: RegistryConfig,
    ) -> Self {
        let rosters = DashMap::new();
        let mut messages = HashMap::new();
        for channel in channels {
            rosters.insert(
                channel.channel_id.clone(),
                ChannelRoster::new(channel.channel_id.clone()),
            );
            if let Some(message_id) = &channel.subscribe_message_id {
                messages.insert(message_id.clone(), channel.channel_id.clone());
            }
        }

        Self {
            config,
            channels: channels
                .iter()
                .map(|c| (c.channel_id.clone(), c.clone()))
                .collect(),
            messages,
            rosters,
            roles,
            store,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restore rosters of configured channels. Returns the number restored.
    pub fn load(&self) -> Result<usize, RegistryError> {
        let mut restored = 0;
        for mut entry in self.rosters.iter_mut() {
            let key = Store::channel_key(entry.key());
            if let Some(roster) = self.store.get::<ChannelRoster>(&key)? {
                *entry.value_mut() = roster;
                restored += 1;
            }
        }
        Ok(restored)
    }

    pub fn persist(&self) -> Result<(), RegistryError> {
        for entry in self.rosters.iter() {
            self.store.put(&Store::channel_key(entry.key()), entry.value())?;
        }
        Ok(())
    }

    pub async fn subscribe(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<SubscriptionOutcome, RegistryError> {
        self.set_membership(user_id, channel_id, true, Utc::now()).await
    }

    pub async fn unsubscribe(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<SubscriptionOutcome, RegistryError> {
        self.set_membership(user_id, channel_id, false, Utc::now()).await
    }

    /// Map a reaction on a subscribe message to a (un)subscribe.
    ///
    /// Reactions on other messages or with another emoji yield `Ok(None)`.
    pub async fn handle_reaction(
        &self,
        event: &ReactionEvent,
    ) -> Result<Option<SubscriptionOutcome>, RegistryError> {
        let Some(channel_id) = self.messages.get(&event.message_id) else {
            return Ok(None);
        };
        let Some(channel) = self.channels.get(channel_id) else {
            return Ok(None);
        };
        if event.emoji.as_deref().is_some_and(|e| e != channel.emoji()) {
            tracing::debug!(message_id = %event.message_id, "Ignoring reaction with other emoji");
            return Ok(None);
        }

        let outcome = self
            .set_membership(&event.user_id, channel_id, event.added, Utc::now())
            .await?;
        Ok(Some(outcome))
    }

    pub fn is_subscribed(&self, user_id: &str, channel_id: &str) -> bool {
        self.rosters
            .get(channel_id)
            .is_some_and(|r| r.is_subscribed(user_id))
    }

    pub fn subscribers(&self, channel_id: &str) -> Result<Vec<Subscriber>, RegistryError> {
        let roster = self
            .rosters
            .get(channel_id)
            .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))?;
        Ok(roster.subscribers.values().cloned().collect())
    }

    pub fn role_sync(&self, channel_id: &str, user_id: &str) -> Option<RoleSync> {
        self.rosters
            .get(channel_id)
            .and_then(|r| r.role_sync.get(user_id).cloned())
    }

    /// Every flagged user of a channel, subscribed or not, ordered by user id
    pub fn role_errors(
        &self,
        channel_id: &str,
    ) -> Result<Vec<(String, RoleSync)>, RegistryError> {
        let roster = self
            .rosters
            .get(channel_id)
            .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))?;
        Ok(roster
            .role_sync
            .iter()
            .filter(|(_, sync)| sync.error.is_some())
            .map(|(user_id, sync)| (user_id.clone(), sync.clone()))
            .collect())
    }

    /// Drop a user's error flag so the reconcile sweep picks them up again
    pub fn clear_error(&self, user_id: &str, channel_id: &str) -> Result<bool, RegistryError> {
        let mut roster = self
            .rosters
            .get_mut(channel_id)
            .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))?;

        let mut next = roster.clone();
        if !next.clear_error(user_id) {
            return Ok(false);
        }
        self.store.put(&Store::channel_key(channel_id), &next)?;
        *roster = next;

        tracing::info!(user_id = %user_id, channel_id = %channel_id, "Role error cleared");
        Ok(true)
    }

    pub async fn reconcile(&self) -> Vec<SubscriptionOutcome> {
        self.reconcile_at(Utc::now()).await
    }

    /// Trailing edge of the debounce: bring roles in line with membership for every
    /// user whose cooldown has passed. Users with an error flag are skipped.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Vec<SubscriptionOutcome> {
        let mut planned = Vec::new();

        for mut entry in self.rosters.iter_mut() {
            let channel_id = entry.key().clone();
            let has_role = self.mention_role(&channel_id).is_some();
            let roster = entry.value_mut();

            for user_id in roster.out_of_sync_users() {
                if roster.has_error(&user_id) {
                    continue;
                }
                if let RolePlan::Call(action) =
                    roster.plan_role_call(&user_id, has_role, now, self.config.cooldown)
                {
                    planned.push((channel_id.clone(), user_id, action));
                }
            }
        }

        // Guard every planned call up front so a dropped sweep releases them all
        let planned: Vec<_> = planned
            .into_iter()
            .map(|(channel_id, user_id, action)| {
                (InFlightGuard::new(self, &channel_id, &user_id), action)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(planned.len());
        for (guard, action) in planned {
            let channel_id = guard.channel_id.clone();
            let user_id = guard.user_id.clone();
            let role = self.apply_role(guard, action).await;
            outcomes.push(SubscriptionOutcome {
                subscribed: self.is_subscribed(&user_id, &channel_id),
                channel_id,
                user_id,
                changed: false,
                role,
            });
        }

        if !outcomes.is_empty() {
            tracing::info!(calls = outcomes.len(), "Role reconcile sweep finished");
        }
        outcomes
    }

    /// Start the periodic reconcile sweep
    pub fn start(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Role reconciler started with interval {:?}", interval);

            let mut ticker = time::interval(interval);
            while self.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                self.reconcile().await;
            }

            tracing::info!("Role reconciler stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn mention_role(&self, channel_id: &str) -> Option<&str> {
        self.channels
            .get(channel_id)
            .and_then(|c| c.mention_role_id.as_deref())
    }

    /// Apply a membership change durably, then run at most one role call
    async fn set_membership(
        &self,
        user_id: &str,
        channel_id: &str,
        subscribed: bool,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionOutcome, RegistryError> {
        let has_role = self.mention_role(channel_id).is_some();

        let (changed, plan) = {
            let mut roster = self
                .rosters
                .get_mut(channel_id)
                .ok_or_else(|| RegistryError::UnknownChannel(channel_id.to_string()))?;

            let mut next = roster.clone();
            let changed = if subscribed {
                next.add(user_id, now)
            } else {
                next.remove(user_id)
            };
            let plan = next.plan_role_call(user_id, has_role, now, self.config.cooldown);

            if changed {
                self.store.put(&Store::channel_key(channel_id), &next)?;
            }
            *roster = next;
            (changed, plan)
        };

        if changed {
            tracing::info!(
                user_id = %user_id,
                channel_id = %channel_id,
                subscribed,
                "Subscription changed"
            );
        }

        let role = match plan {
            RolePlan::Call(action) => {
                let guard = InFlightGuard::new(self, channel_id, user_id);
                self.apply_role(guard, action).await
            }
            RolePlan::NoRole => RoleOutcome::NoRole,
            RolePlan::InSync => RoleOutcome::InSync,
            RolePlan::InFlight => RoleOutcome::InFlight,
            RolePlan::Debounced => {
                tracing::debug!(user_id = %user_id, channel_id = %channel_id, "Role call debounced");
                RoleOutcome::Debounced
            }
        };

        Ok(SubscriptionOutcome {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            changed,
            subscribed,
            role,
        })
    }

    /// Run a planned role call with bounded exponential backoff
    async fn apply_role(&self, guard: InFlightGuard<'_>, action: RoleAction) -> RoleOutcome {
        let channel_id = guard.channel_id.clone();
        let user_id = guard.user_id.clone();
        let (channel_id, user_id) = (channel_id.as_str(), user_id.as_str());

        let Some(role_id) = self.mention_role(channel_id) else {
            self.finish(guard, |r| r.complete(user_id, action, Utc::now()));
            return RoleOutcome::NoRole;
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match action {
                RoleAction::Grant => self.roles.grant_role(user_id, role_id).await,
                RoleAction::Revoke => self.roles.revoke_role(user_id, role_id).await,
            };

            match result {
                Ok(()) => {
                    self.finish(guard, |r| r.complete(user_id, action, Utc::now()));
                    tracing::info!(
                        user_id = %user_id,
                        role_id = %role_id,
                        ?action,
                        attempts,
                        "Role updated"
                    );
                    return RoleOutcome::Applied { action, attempts };
                }
                Err(e) if attempts <= self.config.retry_max => {
                    let delay = backoff(self.config.backoff_base, attempts);
                    tracing::warn!(
                        user_id = %user_id,
                        role_id = %role_id,
                        ?action,
                        attempts,
                        error = %e,
                        "Role call failed, retrying in {:?}",
                        delay
                    );
                    time::sleep(delay).await;
                }
                Err(e) => {
                    self.record_failure(guard, role_id, action, &e, attempts);
                    return RoleOutcome::Failed {
                        action,
                        attempts,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    fn record_failure(
        &self,
        guard: InFlightGuard<'_>,
        role_id: &str,
        action: RoleAction,
        error: &PlatformError,
        attempts: u32,
    ) {
        let user_id = guard.user_id.clone();
        tracing::error!(
            user_id = %user_id,
            role_id = %role_id,
            ?action,
            attempts,
            error = %error,
            "Role call abandoned, error flag set"
        );
        self.finish(guard, |r| {
            r.fail(&user_id, action, error, attempts, Utc::now())
        });
    }

    /// Update a roster after a role call and persist it
    fn finish(&self, mut guard: InFlightGuard<'_>, update: impl FnOnce(&mut ChannelRoster)) {
        guard.armed = false;
        let channel_id = guard.channel_id.as_str();
        let Some(mut roster) = self.rosters.get_mut(channel_id) else {
            return;
        };
        update(roster.value_mut());

        if let Err(e) = self.store.put(&Store::channel_key(channel_id), &*roster) {
            tracing::error!(channel_id = %channel_id, error = %e, "Failed to persist role state");
        }
    }
}

/// Releases a user's in-flight mark when a role call is dropped before it finishes,
/// e.g. when the request driving it is cancelled during a backoff sleep
struct InFlightGuard<'a> {
    registry: &'a SubscriptionRegistry,
    channel_id: String,
    user_id: String,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(registry: &'a SubscriptionRegistry, channel_id: &str, user_id: &str) -> Self {
        Self {
            registry,
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            armed: true,
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(mut roster) = self.registry.rosters.get_mut(&self.channel_id) {
            roster.release(&self.user_id);
        }
        tracing::warn!(
            user_id = %self.user_id,
            channel_id = %self.channel_id,
            "Role call dropped before completion, left for the reconcile sweep"
        );
    }
}

/// `base * 2^(attempt-1)` plus up to half of that as jitter, capped
fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base
        .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
        .min(MAX_BACKOFF);
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
    (exp + Duration::from_millis(jitter_ms)).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::{RecordingRoles, RoleOp};
    use crate::storage::persistence::MemoryBackend;

    struct Fixture {
        registry: SubscriptionRegistry,
        roles: Arc<RecordingRoles>,
        backend: Arc<MemoryBackend>,
    }

    fn channels() -> Vec<AlertChannelConfig> {
        vec![
            AlertChannelConfig::new("alerts")
                .with_mention_role("role-1")
                .with_subscribe_message("msg-1"),
            AlertChannelConfig::new("quiet"),
        ]
    }

    fn config(cooldown_secs: i64, retry_max: u32) -> RegistryConfig {
        RegistryConfig {
            cooldown: chrono::Duration::seconds(cooldown_secs),
            retry_max,
            backoff_base: Duration::ZERO,
        }
    }

    fn fixture(config: RegistryConfig) -> Fixture {
        let roles = Arc::new(RecordingRoles::new());
        let backend = Arc::new(MemoryBackend::new());
        let registry = SubscriptionRegistry::new(
            &channels(),
            roles.clone(),
            Store::new(backend.clone()),
            config,
        );
        Fixture {
            registry,
            roles,
            backend,
        }
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let f = fixture(config(0, 0));

        let first = f.registry.subscribe("u1", "alerts").await.unwrap();
        assert!(first.changed);
        assert_eq!(
            first.role,
            RoleOutcome::Applied {
                action: RoleAction::Grant,
                attempts: 1
            }
        );

        let second = f.registry.subscribe("u1", "alerts").await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.role, RoleOutcome::InSync);

        assert_eq!(f.roles.calls().len(), 1);
        assert_eq!(f.registry.subscribers("alerts").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_user_is_noop() {
        let f = fixture(config(0, 0));
        let outcome = f.registry.unsubscribe("ghost", "alerts").await.unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.role, RoleOutcome::InSync);
        assert!(f.roles.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rapid_toggle_debounced() {
        let f = fixture(config(3600, 0));

        f.registry.subscribe("u1", "alerts").await.unwrap();
        let out = f.registry.unsubscribe("u1", "alerts").await.unwrap();

        assert_eq!(out.role, RoleOutcome::Debounced);
        assert!(!f.registry.is_subscribed("u1", "alerts"));
        let calls = f.roles.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, RoleOp::Grant);

        // Nothing fires while the cooldown is still running
        assert!(f.registry.reconcile().await.is_empty());

        // Trailing edge
        let later = Utc::now() + chrono::Duration::hours(2);
        let swept = f.registry.reconcile_at(later).await;
        assert_eq!(swept.len(), 1);
        assert_eq!(f.roles.calls()[1].op, RoleOp::Revoke);

        assert!(f
            .registry
            .reconcile_at(later + chrono::Duration::hours(2))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_toggle_back_within_cooldown_needs_no_call() {
        let f = fixture(config(3600, 0));

        f.registry.subscribe("u1", "alerts").await.unwrap();
        f.registry.unsubscribe("u1", "alerts").await.unwrap();
        f.registry.subscribe("u1", "alerts").await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(f.registry.reconcile_at(later).await.is_empty());
        assert_eq!(f.roles.calls().len(), 1);
        assert!(f.registry.is_subscribed("u1", "alerts"));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let f = fixture(config(0, 3));
        f.roles.fail_next(2);

        let out = f.registry.subscribe("u1", "alerts").await.unwrap();
        assert_eq!(
            out.role,
            RoleOutcome::Applied {
                action: RoleAction::Grant,
                attempts: 3
            }
        );
        assert_eq!(f.roles.calls().len(), 3);
        assert!(f.registry.role_sync("alerts", "u1").unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_sets_error_flag() {
        let f = fixture(config(0, 2));
        f.roles.fail_next(10);

        let out = f.registry.subscribe("u1", "alerts").await.unwrap();
        assert!(matches!(out.role, RoleOutcome::Failed { attempts: 3, .. }));
        assert_eq!(f.roles.calls().len(), 3);

        // Membership survives the failed side effect
        assert!(f.registry.is_subscribed("u1", "alerts"));
        let sync = f.registry.role_sync("alerts", "u1").unwrap();
        assert_eq!(sync.granted, None);
        assert!(sync.error.is_some());

        // Flagged users are left alone by the sweep
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(f.registry.reconcile_at(later).await.is_empty());

        f.roles.fail_next(0);
        assert!(f.registry.clear_error("u1", "alerts").unwrap());
        let swept = f.registry.reconcile_at(later).await;
        assert_eq!(swept.len(), 1);
        assert_eq!(f.registry.role_sync("alerts", "u1").unwrap().granted, Some(true));
    }

    #[tokio::test]
    async fn test_channel_without_role() {
        let f = fixture(config(0, 0));
        let out = f.registry.subscribe("u1", "quiet").await.unwrap();
        assert_eq!(out.role, RoleOutcome::NoRole);
        assert!(f.roles.calls().is_empty());
        assert!(f.registry.is_subscribed("u1", "quiet"));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let f = fixture(config(0, 0));
        let result = f.registry.subscribe("u1", "nowhere").await;
        assert!(matches!(result, Err(RegistryError::UnknownChannel(_))));
        assert!(f.registry.subscribers("nowhere").is_err());
    }

    #[tokio::test]
    async fn test_reactions_resolve_channel() {
        let f = fixture(config(0, 0));

        let add = ReactionEvent {
            user_id: "u1".into(),
            message_id: "msg-1".into(),
            emoji: Some(crate::alerts::DEFAULT_EMOJI.into()),
            added: true,
        };
        let out = f.registry.handle_reaction(&add).await.unwrap().unwrap();
        assert_eq!(out.channel_id, "alerts");
        assert!(f.registry.is_subscribed("u1", "alerts"));

        let other_message = ReactionEvent {
            message_id: "msg-unknown".into(),
            ..add.clone()
        };
        assert!(f.registry.handle_reaction(&other_message).await.unwrap().is_none());

        let other_emoji = ReactionEvent {
            emoji: Some("👍".into()),
            added: false,
            ..add.clone()
        };
        assert!(f.registry.handle_reaction(&other_emoji).await.unwrap().is_none());
        assert!(f.registry.is_subscribed("u1", "alerts"));

        let remove = ReactionEvent {
            added: false,
            ..add
        };
        f.registry.handle_reaction(&remove).await.unwrap();
        assert!(!f.registry.is_subscribed("u1", "alerts"));
    }

    #[tokio::test]
    async fn test_membership_survives_restart() {
        let f = fixture(config(0, 0));
        f.registry.subscribe("u1", "alerts").await.unwrap();
        f.registry.subscribe("u2", "quiet").await.unwrap();

        let roles = Arc::new(RecordingRoles::new());
        let restored = SubscriptionRegistry::new(
            &channels(),
            roles.clone(),
            Store::new(f.backend.clone()),
            config(0, 0),
        );
        assert_eq!(restored.load().unwrap(), 2);
        assert!(restored.is_subscribed("u1", "alerts"));
        assert!(restored.is_subscribed("u2", "quiet"));

        // Role state came back too, so nothing is re-granted
        assert!(restored.reconcile().await.is_empty());
        assert!(roles.calls().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_membership_unchanged() {
        let f = fixture(config(0, 0));
        f.backend.fail_next_writes(1);

        let result = f.registry.subscribe("u1", "alerts").await;
        assert!(matches!(result, Err(RegistryError::Persistence(_))));
        assert!(!f.registry.is_subscribed("u1", "alerts"));
        assert!(f.roles.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_subscribers() {
        let f = fixture(config(0, 0));
        let users: Vec<String> = (0..20).map(|i| format!("u{}", i)).collect();

        let calls = users.iter().map(|u| f.registry.subscribe(u, "alerts"));
        for result in futures::future::join_all(calls).await {
            assert!(result.unwrap().changed);
        }

        assert_eq!(f.registry.subscribers("alerts").unwrap().len(), 20);
        assert_eq!(f.roles.calls().len(), 20);
    }

    #[tokio::test]
    async fn test_dropped_role_call_is_released() {
        let f = fixture(RegistryConfig {
            cooldown: chrono::Duration::zero(),
            retry_max: 1,
            backoff_base: Duration::from_secs(5),
        });
        f.roles.fail_next(1);

        // The caller goes away while the call sleeps before its retry
        let dropped = time::timeout(
            Duration::from_millis(50),
            f.registry.subscribe("u1", "alerts"),
        )
        .await;
        assert!(dropped.is_err());
        assert!(f.registry.is_subscribed("u1", "alerts"));

        let sync = f.registry.role_sync("alerts", "u1").unwrap();
        assert!(!sync.in_flight);
        assert_eq!(sync.granted, None);

        // The sweep brings the role in line
        let swept = f.registry.reconcile_at(Utc::now() + chrono::Duration::hours(5)).await;
        assert_eq!(swept.len(), 1);
        assert_eq!(
            swept[0].role,
            RoleOutcome::Applied {
                action: RoleAction::Grant,
                attempts: 1
            }
        );
        assert_eq!(f.registry.role_sync("alerts", "u1").unwrap().granted, Some(true));
    }

    #[tokio::test]
    async fn test_dropped_sweep_releases_every_planned_call() {
        let f = fixture(RegistryConfig {
            cooldown: chrono::Duration::hours(1),
            retry_max: 1,
            backoff_base: Duration::from_secs(5),
        });
        f.registry.subscribe("u1", "alerts").await.unwrap();
        f.registry.subscribe("u2", "alerts").await.unwrap();
        f.registry.unsubscribe("u1", "alerts").await.unwrap();
        f.registry.unsubscribe("u2", "alerts").await.unwrap();

        f.roles.fail_next(1);
        let later = Utc::now() + chrono::Duration::hours(2);
        let dropped = time::timeout(Duration::from_millis(50), f.registry.reconcile_at(later)).await;
        assert!(dropped.is_err());

        for user in ["u1", "u2"] {
            assert!(!f.registry.role_sync("alerts", user).unwrap().in_flight);
        }
        assert_eq!(f.registry.reconcile_at(later).await.len(), 2);
        assert_eq!(f.registry.role_sync("alerts", "u1").unwrap().granted, Some(false));
        assert_eq!(f.registry.role_sync("alerts", "u2").unwrap().granted, Some(false));
    }

    #[tokio::test]
    async fn test_role_errors_include_departed_users() {
        let f = fixture(config(0, 0));
        f.registry.subscribe("u1", "alerts").await.unwrap();
        f.registry.subscribe("u2", "alerts").await.unwrap();

        f.roles.fail_next(1);
        let out = f.registry.unsubscribe("u1", "alerts").await.unwrap();
        assert!(matches!(out.role, RoleOutcome::Failed { .. }));

        // u1 is no longer a member but still holds the role
        assert_eq!(f.registry.subscribers("alerts").unwrap().len(), 1);
        let errors = f.registry.role_errors("alerts").unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "u1");
        assert_eq!(errors[0].1.granted, Some(true));
        assert_eq!(
            errors[0].1.error.as_ref().unwrap().action,
            RoleAction::Revoke
        );

        assert!(f.registry.clear_error("u1", "alerts").unwrap());
        assert!(f.registry.role_errors("alerts").unwrap().is_empty());
        assert!(f.registry.role_errors("nowhere").is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let first = backoff(base, 1);
        assert!(first >= base && first <= base + base / 2);

        let third = backoff(base, 3);
        assert!(third >= base * 4);

        assert!(backoff(base, 40) <= MAX_BACKOFF);
        assert_eq!(backoff(Duration::ZERO, 5), Duration::ZERO);
    }
}
