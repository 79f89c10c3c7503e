//! Per-entity hysteresis state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::config::Thresholds;
use crate::data::Health;

/// Latched alert status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    #[default]
    Normal,
    Alerted,
}

/// Direction of a latched transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    WentDown,
    Recovered,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::WentDown => write!(f, "went_down"),
            Direction::Recovered => write!(f, "recovered"),
        }
    }
}

/// Persistent alert record of one entity
///
/// `status` is the latch: once `Alerted`, further Down ticks keep counting but never
/// re-emit, and only `up` consecutive Healthy ticks release it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub down_count: u32,
    pub up_count: u32,
    pub status: AlertStatus,
    /// Timestamp of the last tick folded into this state
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl AlertState {
    pub fn is_alerted(&self) -> bool {
        self.status == AlertStatus::Alerted
    }

    /// Whether a tick at `at` was already folded in
    pub fn has_seen(&self, at: DateTime<Utc>) -> bool {
        self.last_tick_at.is_some_and(|last| at <= last)
    }

    /// Fold one health value into the counters. Returns the transition it latches, if any.
    pub fn apply(&mut self, health: Health, thresholds: &Thresholds) -> Option<Direction> {
        match health {
            Health::Down => {
                self.down_count = self.down_count.saturating_add(1);
                self.up_count = 0;
                if self.status == AlertStatus::Normal && self.down_count >= thresholds.down {
                    self.status = AlertStatus::Alerted;
                    return Some(Direction::WentDown);
                }
            }
            Health::Healthy => {
                self.up_count = self.up_count.saturating_add(1);
                self.down_count = 0;
                if self.status == AlertStatus::Alerted && self.up_count >= thresholds.up {
                    self.status = AlertStatus::Normal;
                    self.down_count = 0;
                    self.up_count = 0;
                    return Some(Direction::Recovered);
                }
            }
            // Neutral: neither accumulates nor resets
            Health::Warning => {}
        }
        None
    }
}

/// A transition decided in one cycle, consumed by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertTransition {
    pub entity_id: String,
    pub direction: Direction,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Health::{Down as D, Healthy as H, Warning as W};

    fn run(state: &mut AlertState, ticks: &[Health]) -> Vec<Direction> {
        let thresholds = Thresholds::default();
        ticks
            .iter()
            .filter_map(|t| state.apply(*t, &thresholds))
            .collect()
    }

    #[test]
    fn test_outage_then_recovery() {
        let mut state = AlertState::default();

        assert_eq!(run(&mut state, &[H, H, D]), vec![]);
        assert_eq!(run(&mut state, &[D]), vec![Direction::WentDown]);
        assert!(state.is_alerted());

        assert_eq!(run(&mut state, &[D, H, H]), vec![]);
        assert_eq!(run(&mut state, &[H]), vec![Direction::Recovered]);
        assert_eq!(state, AlertState::default());
    }

    #[test]
    fn test_warning_is_neutral_during_recovery() {
        let mut state = AlertState::default();

        assert_eq!(run(&mut state, &[H, D, D]), vec![Direction::WentDown]);
        assert_eq!(run(&mut state, &[W, W, H, H]), vec![]);
        assert_eq!(run(&mut state, &[H]), vec![Direction::Recovered]);
    }

    #[test]
    fn test_warning_between_greens_does_not_reset() {
        let mut state = AlertState::default();
        run(&mut state, &[D, D]);

        assert_eq!(run(&mut state, &[H, W, H, W]), vec![]);
        assert_eq!(state.up_count, 2);
        assert_eq!(run(&mut state, &[H]), vec![Direction::Recovered]);
    }

    #[test]
    fn test_isolated_blip_is_ignored() {
        let mut state = AlertState::default();
        assert_eq!(run(&mut state, &[H, H, D, H, H]), vec![]);
        assert!(!state.is_alerted());
    }

    #[test]
    fn test_warning_does_not_bridge_outage() {
        let mut state = AlertState::default();
        // W neither resets nor advances: D,W,D still counts two consecutive reds
        assert_eq!(run(&mut state, &[D, W, D]), vec![Direction::WentDown]);
    }

    #[test]
    fn test_latch_holds_under_continued_outage() {
        let mut state = AlertState::default();
        let emitted = run(&mut state, &[D, D, D, D, D, D]);
        assert_eq!(emitted, vec![Direction::WentDown]);
        assert_eq!(state.down_count, 6);
    }

    #[test]
    fn test_relapse_must_re_earn_recovery() {
        let mut state = AlertState::default();
        run(&mut state, &[D, D]);

        assert_eq!(run(&mut state, &[H, H, D, H, H]), vec![]);
        assert!(state.is_alerted());
        assert_eq!(run(&mut state, &[H]), vec![Direction::Recovered]);
    }

    #[test]
    fn test_normal_never_recovers() {
        let mut state = AlertState::default();
        assert_eq!(run(&mut state, &[H; 10]), vec![]);
    }

    #[test]
    fn test_went_down_count_matches_threshold_crossings() {
        // Deterministic pseudo-random walk over all three values
        let mut seed: u32 = 0x2545_f491;
        let mut ticks = Vec::new();
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            ticks.push(match seed % 3 {
                0 => H,
                1 => W,
                _ => D,
            });
        }

        let thresholds = Thresholds::default();
        let mut state = AlertState::default();
        let mut went_down = 0;
        let mut crossings = 0;
        for t in ticks {
            let was_normal = state.status == AlertStatus::Normal;
            let transition = state.apply(t, &thresholds);
            if was_normal && t == D && state.down_count == thresholds.down {
                crossings += 1;
            }
            if transition == Some(Direction::WentDown) {
                went_down += 1;
            }
        }

        assert!(went_down > 0);
        assert_eq!(went_down, crossings);
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = Thresholds { down: 1, up: 1 };
        let mut state = AlertState::default();

        assert_eq!(state.apply(D, &thresholds), Some(Direction::WentDown));
        assert_eq!(state.apply(H, &thresholds), Some(Direction::Recovered));
    }
}
