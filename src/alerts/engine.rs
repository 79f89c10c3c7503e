//! Alert engine: folds ticks into per-entity state machines

use dashmap::DashMap;

use super::config::Thresholds;
use super::state::{AlertState, AlertTransition};
use crate::data::{MonitoredEntity, StatusTick};
use crate::storage::{PersistenceError, Store};

/// Owns the alert state of every configured entity
pub struct AlertEngine {
    thresholds: Thresholds,
    /// Entity ids in configuration order
    order: Vec<String>,
    states: DashMap<String, AlertState>,
}

/// Next state of one entity, computed but not yet installed
///
/// The poll cycle persists `state` first and only then commits it, so a transition is
/// never emitted for a state the store does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTick {
    pub entity_id: String,
    pub state: AlertState,
    pub transition: Option<AlertTransition>,
}

impl AlertEngine {
    pub fn new(entities: &[MonitoredEntity], thresholds: Thresholds) -> Self {
        let states = DashMap::new();
        for entity in entities {
            states.insert(entity.id.clone(), AlertState::default());
        }

        Self {
            thresholds,
            order: entities.iter().map(|e| e.id.clone()).collect(),
            states,
        }
    }

    /// Compute the effect of a tick without mutating engine state.
    ///
    /// Returns `Ok(None)` when the tick is not newer than the last one folded in.
    pub fn stage(&self, tick: &StatusTick) -> Result<Option<StagedTick>, EngineError> {
        let current = self
            .states
            .get(&tick.entity_id)
            .ok_or_else(|| EngineError::UnknownEntity(tick.entity_id.clone()))?;

        if current.has_seen(tick.at) {
            tracing::debug!(
                entity_id = %tick.entity_id,
                at = %tick.at,
                "Tick already processed, skipping"
            );
            return Ok(None);
        }

        let mut state = current.clone();
        drop(current);

        let transition = state
            .apply(tick.health, &self.thresholds)
            .map(|direction| AlertTransition {
                entity_id: tick.entity_id.clone(),
                direction,
                at: tick.at,
            });
        state.last_tick_at = Some(tick.at);

        Ok(Some(StagedTick {
            entity_id: tick.entity_id.clone(),
            state,
            transition,
        }))
    }

    /// Install a staged state and release its transition
    pub fn commit(&self, staged: StagedTick) -> Result<Option<AlertTransition>, EngineError> {
        let mut current = self
            .states
            .get_mut(&staged.entity_id)
            .ok_or_else(|| EngineError::UnknownEntity(staged.entity_id.clone()))?;

        let stale = match (current.last_tick_at, staged.state.last_tick_at) {
            (Some(installed), Some(incoming)) => incoming <= installed,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            return Err(EngineError::StaleCommit(staged.entity_id));
        }

        *current = staged.state;

        if let Some(transition) = &staged.transition {
            tracing::info!(
                entity_id = %transition.entity_id,
                direction = %transition.direction,
                down_count = current.down_count,
                "Alert state latched"
            );
        }

        Ok(staged.transition)
    }

    /// Stage and commit in one step, for callers that do not persist
    pub fn process(&self, tick: &StatusTick) -> Result<Option<AlertTransition>, EngineError> {
        match self.stage(tick)? {
            Some(staged) => self.commit(staged),
            None => Ok(None),
        }
    }

    pub fn state(&self, entity_id: &str) -> Result<AlertState, EngineError> {
        self.states
            .get(entity_id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::UnknownEntity(entity_id.to_string()))
    }

    /// All states in configuration order
    pub fn states(&self) -> Vec<(String, AlertState)> {
        self.order
            .iter()
            .filter_map(|id| self.states.get(id).map(|s| (id.clone(), s.clone())))
            .collect()
    }

    /// Restore persisted states. Entities without a record start `Normal`.
    pub fn load(&self, store: &Store) -> Result<usize, EngineError> {
        let mut restored = 0;

        for entity_id in &self.order {
            if let Some(state) = store.get::<AlertState>(&Store::alert_key(entity_id))? {
                if state.is_alerted() {
                    tracing::info!(entity_id = %entity_id, "Restored latched alert");
                }
                self.states.insert(entity_id.clone(), state);
                restored += 1;
            }
        }

        Ok(restored)
    }

    pub fn persist(&self, store: &Store) -> Result<(), EngineError> {
        for (entity_id, state) in self.states() {
            store.put(&Store::alert_key(&entity_id), &state)?;
        }
        store.sync()?;
        Ok(())
    }

    /// Write a staged state ahead of its commit
    pub fn persist_staged(store: &Store, staged: &StagedTick) -> Result<(), PersistenceError> {
        store.put(&Store::alert_key(&staged.entity_id), &staged.state)
    }
}

/// Alert engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Staged state for '{0}' is older than the installed one")]
    StaleCommit(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}
