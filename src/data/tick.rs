use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized health value of one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Warning,
    Down,
}

impl Health {
    /// Map the upstream colour vocabulary. Unknown values yield no health.
    pub fn from_upstream(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "green" => Some(Health::Healthy),
            "yellow" | "orange" => Some(Health::Warning),
            "red" => Some(Health::Down),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Health::Healthy => "🟢",
            Health::Warning => "🟠",
            Health::Down => "🔴",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Warning => write!(f, "warning"),
            Health::Down => write!(f, "down"),
        }
    }
}

/// Request statistics reported alongside a model's health
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TickMetrics {
    pub avg_latency_ms: u64,
    /// Percent of requests that timed out (0-100)
    pub timeout_pct: f64,
    /// Percent of requests that failed (0-100)
    pub fail_pct: f64,
}

/// One normalized health observation for one entity in one poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTick {
    pub entity_id: String,
    pub at: DateTime<Utc>,
    pub health: Health,
    /// Only model readings carry metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TickMetrics>,
}

impl StatusTick {
    pub fn new(entity_id: impl Into<String>, at: DateTime<Utc>, health: Health) -> Self {
        Self {
            entity_id: entity_id.into(),
            at,
            health,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TickMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_vocabulary() {
        assert_eq!(Health::from_upstream("green"), Some(Health::Healthy));
        assert_eq!(Health::from_upstream("Orange"), Some(Health::Warning));
        assert_eq!(Health::from_upstream("yellow"), Some(Health::Warning));
        assert_eq!(Health::from_upstream("red"), Some(Health::Down));
        assert_eq!(Health::from_upstream("unknown"), None);
        assert_eq!(Health::from_upstream(""), None);
    }

    #[test]
    fn test_tick_without_metrics_reads_older_records() {
        let json = r#"{"entity_id":"api","at":"2024-05-01T12:00:00Z","health":"Down"}"#;
        let tick: StatusTick = serde_json::from_str(json).unwrap();
        assert_eq!(tick.metrics, None);
        assert!(!serde_json::to_string(&tick).unwrap().contains("metrics"));
    }
}
