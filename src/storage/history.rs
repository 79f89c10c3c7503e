//! Bounded per-entity tick history

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;

use super::persistence::{PersistenceError, Store};
use crate::data::{Health, MonitoredEntity, StatusTick, TickMetrics};

/// Default number of ticks kept per entity
pub const DEFAULT_HISTORY_DEPTH: usize = 10;

/// Rolling window of the most recent ticks for every configured entity
pub struct HistoryStore {
    depth: usize,
    /// Entity ids in configuration order
    order: Vec<String>,
    windows: DashMap<String, VecDeque<StatusTick>>,
}

/// Share of each health value over the current window, plus request statistics
/// averaged over the ticks that reported them
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UptimeSummary {
    pub samples: usize,
    pub healthy_pct: f64,
    pub warning_pct: f64,
    pub down_pct: f64,
    pub avg_latency_ms: Option<f64>,
    pub avg_timeout_pct: Option<f64>,
    pub avg_fail_pct: Option<f64>,
}

impl HistoryStore {
    pub fn new(entities: &[MonitoredEntity], depth: usize) -> Self {
        let depth = depth.max(1);
        let windows = DashMap::new();
        for entity in entities {
            windows.insert(entity.id.clone(), VecDeque::with_capacity(depth));
        }

        Self {
            depth,
            order: entities.iter().map(|e| e.id.clone()).collect(),
            windows,
        }
    }

    /// Push a tick, evicting the oldest entry once the window is full
    pub fn append(&self, entity_id: &str, tick: StatusTick) -> Result<(), HistoryError> {
        check_owner(entity_id, &tick)?;

        let mut window = self
            .windows
            .get_mut(entity_id)
            .ok_or_else(|| HistoryError::UnknownEntity(entity_id.to_string()))?;

        while window.len() >= self.depth {
            window.pop_front();
        }
        window.push_back(tick);

        Ok(())
    }

    /// The window `append` would produce, leaving the stored one untouched
    pub fn staged_window(
        &self,
        entity_id: &str,
        tick: &StatusTick,
    ) -> Result<Vec<StatusTick>, HistoryError> {
        check_owner(entity_id, tick)?;
        let window = self
            .windows
            .get(entity_id)
            .ok_or_else(|| HistoryError::UnknownEntity(entity_id.to_string()))?;

        let skip = (window.len() + 1).saturating_sub(self.depth);
        Ok(window
            .iter()
            .skip(skip)
            .cloned()
            .chain(std::iter::once(tick.clone()))
            .collect())
    }

    /// Current window, oldest first
    pub fn window(&self, entity_id: &str) -> Result<Vec<StatusTick>, HistoryError> {
        self.windows
            .get(entity_id)
            .map(|w| w.iter().cloned().collect())
            .ok_or_else(|| HistoryError::UnknownEntity(entity_id.to_string()))
    }

    /// Newest tick, if any
    pub fn latest(&self, entity_id: &str) -> Result<Option<StatusTick>, HistoryError> {
        self.windows
            .get(entity_id)
            .map(|w| w.back().cloned())
            .ok_or_else(|| HistoryError::UnknownEntity(entity_id.to_string()))
    }

    pub fn uptime(&self, entity_id: &str) -> Result<UptimeSummary, HistoryError> {
        let window = self
            .windows
            .get(entity_id)
            .ok_or_else(|| HistoryError::UnknownEntity(entity_id.to_string()))?;

        let samples = window.len();
        if samples == 0 {
            return Ok(UptimeSummary::default());
        }

        let pct = |health: Health| {
            let count = window.iter().filter(|t| t.health == health).count();
            count as f64 * 100.0 / samples as f64
        };

        let metrics: Vec<TickMetrics> = window.iter().filter_map(|t| t.metrics).collect();
        let mean = |value: fn(&TickMetrics) -> f64| {
            (!metrics.is_empty())
                .then(|| metrics.iter().map(value).sum::<f64>() / metrics.len() as f64)
        };

        Ok(UptimeSummary {
            samples,
            healthy_pct: pct(Health::Healthy),
            warning_pct: pct(Health::Warning),
            down_pct: pct(Health::Down),
            avg_latency_ms: mean(|m| m.avg_latency_ms as f64),
            avg_timeout_pct: mean(|m| m.timeout_pct),
            avg_fail_pct: mean(|m| m.fail_pct),
        })
    }

    /// Restore windows from the store. Missing records leave the window empty.
    ///
    /// Returns the number of entities that had persisted history.
    pub fn load(&self, store: &Store) -> Result<usize, HistoryError> {
        let mut restored = 0;

        for entity_id in &self.order {
            let Some(ticks) = store.get::<Vec<StatusTick>>(&Store::history_key(entity_id))? else {
                continue;
            };

            // A shrunk depth keeps the newest ticks
            let skip = ticks.len().saturating_sub(self.depth);
            let window: VecDeque<StatusTick> = ticks
                .into_iter()
                .skip(skip)
                .filter(|t| &t.entity_id == entity_id)
                .collect();

            self.windows.insert(entity_id.clone(), window);
            restored += 1;
        }

        tracing::debug!(restored, "History windows loaded");
        Ok(restored)
    }

    /// Write every window to the store
    pub fn persist(&self, store: &Store) -> Result<(), HistoryError> {
        for entity_id in &self.order {
            self.persist_entity(store, entity_id)?;
        }
        store.sync()?;
        Ok(())
    }

    pub fn persist_entity(&self, store: &Store, entity_id: &str) -> Result<(), HistoryError> {
        let window = self.window(entity_id)?;
        Self::persist_window(store, entity_id, &window)
    }

    /// Write a window produced by [`HistoryStore::staged_window`]
    pub fn persist_window(
        store: &Store,
        entity_id: &str,
        window: &[StatusTick],
    ) -> Result<(), HistoryError> {
        store.put(&Store::history_key(entity_id), &window)?;
        Ok(())
    }
}

fn check_owner(entity_id: &str, tick: &StatusTick) -> Result<(), HistoryError> {
    if tick.entity_id == entity_id {
        Ok(())
    } else {
        Err(HistoryError::MismatchedTick {
            expected: entity_id.to_string(),
            actual: tick.entity_id.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Tick for '{actual}' appended to '{expected}'")]
    MismatchedTick { expected: String, actual: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}
