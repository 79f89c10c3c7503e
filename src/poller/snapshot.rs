//! Upstream status document parsing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::FetchError;
use crate::data::{EntityKind, Health, MonitoredEntity, StatusTick, TickMetrics, API_ENTITY_ID};

/// One model's reading from a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelReading {
    pub id: String,
    /// Raw upstream colour
    pub raw_health: String,
    pub health: Option<Health>,
    pub avg_latency_ms: u64,
    /// Percent of requests that timed out (0-100)
    pub timeout_pct: f64,
    /// Percent of requests that failed (0-100)
    pub fail_pct: f64,
}

/// Normalized view of the newest history entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    pub api_health: Option<Health>,
    pub models: Vec<ModelReading>,
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    api: Option<String>,
    #[serde(default)]
    inference: BTreeMap<String, serde_json::Value>,
}

/// Parse the upstream document. The first history entry is the newest.
///
/// An unparsable `updated` falls back to `now`. Model entries that are not objects are
/// dropped; unknown colours are kept with `health: None`.
pub fn parse_status_document(body: &str, now: DateTime<Utc>) -> Result<HealthSnapshot, FetchError> {
    let document: StatusDocument =
        serde_json::from_str(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    let latest = document
        .history
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::Parse("no history entries".to_string()))?;

    let taken_at = latest
        .updated
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| {
            tracing::debug!(updated = ?latest.updated, "Unparsable snapshot time, using now");
            now
        });

    let models = latest
        .inference
        .iter()
        .filter_map(|(id, value)| parse_model(id, value))
        .collect();

    Ok(HealthSnapshot {
        taken_at,
        api_health: latest.api.as_deref().and_then(Health::from_upstream),
        models,
    })
}

fn parse_model(id: &str, value: &serde_json::Value) -> Option<ModelReading> {
    let object = value.as_object()?;
    let number = |key: &str| object.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
    let raw_health = object
        .get("health")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    Some(ModelReading {
        id: id.to_string(),
        health: Health::from_upstream(&raw_health),
        raw_health,
        avg_latency_ms: number("avg").max(0.0) as u64,
        timeout_pct: number("timeout") * 100.0,
        fail_pct: number("fail") * 100.0,
    })
}

impl ModelReading {
    pub fn metrics(&self) -> TickMetrics {
        TickMetrics {
            avg_latency_ms: self.avg_latency_ms,
            timeout_pct: self.timeout_pct,
            fail_pct: self.fail_pct,
        }
    }
}

impl HealthSnapshot {
    pub fn model(&self, id: &str) -> Option<&ModelReading> {
        self.models.iter().find(|m| m.id.eq_ignore_ascii_case(id))
    }

    /// Ticks for the configured entities, in configuration order.
    ///
    /// Entities missing from the snapshot or with an unknown colour get no tick.
    pub fn to_ticks(&self, entities: &[MonitoredEntity]) -> Vec<StatusTick> {
        entities
            .iter()
            .filter_map(|entity| {
                let (health, metrics) = match entity.kind {
                    EntityKind::Api if entity.id == API_ENTITY_ID => (self.api_health, None),
                    EntityKind::Api => (None, None),
                    EntityKind::Model => match self.model(&entity.id) {
                        Some(reading) => (reading.health, Some(reading.metrics())),
                        None => (None, None),
                    },
                };
                let Some(health) = health else {
                    tracing::debug!(entity_id = %entity.id, "No usable reading this cycle");
                    return None;
                };

                let tick = StatusTick::new(entity.id.clone(), self.taken_at, health);
                Some(match metrics {
                    Some(metrics) => tick.with_metrics(metrics),
                    None => tick,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::default_entities;
    use chrono::TimeZone;

    const DOCUMENT: &str = r#"{
        "history": [
            {
                "updated": "2024-05-01T12:00:00Z",
                "api": "green",
                "inference": {
                    "asha": {"health": "green", "avg": 812, "timeout": 0.0074, "fail": 0.01},
                    "soji": {"health": "orange", "avg": 1500.6, "timeout": 0.2, "fail": 0},
                    "mixtral": {"health": "red", "avg": 0, "timeout": 1, "fail": 1},
                    "mythomax": {"health": "purple"},
                    "broken": "not an object"
                }
            },
            {
                "updated": "2024-05-01T11:55:00Z",
                "api": "red",
                "inference": {}
            }
        ]
    }"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_newest_entry() {
        let snapshot = parse_status_document(DOCUMENT, now()).unwrap();

        assert_eq!(snapshot.taken_at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        assert_eq!(snapshot.api_health, Some(Health::Healthy));
        assert_eq!(snapshot.models.len(), 4);

        let asha = snapshot.model("asha").unwrap();
        assert_eq!(asha.avg_latency_ms, 812);
        assert!((asha.timeout_pct - 0.74).abs() < 1e-9);
        assert!((asha.fail_pct - 1.0).abs() < 1e-9);

        assert_eq!(snapshot.model("soji").unwrap().health, Some(Health::Warning));
        assert_eq!(snapshot.model("mythomax").unwrap().health, None);
        assert!(snapshot.model("broken").is_none());
    }

    #[test]
    fn test_ticks_skip_missing_and_unknown() {
        let snapshot = parse_status_document(DOCUMENT, now()).unwrap();
        let ticks = snapshot.to_ticks(&default_entities());

        let ids: Vec<&str> = ticks.iter().map(|t| t.entity_id.as_str()).collect();
        // mobile and mistral are absent, mythomax is purple
        assert_eq!(ids, vec!["api", "asha", "soji", "mixtral"]);
        assert!(ticks.iter().all(|t| t.at == snapshot.taken_at));
        assert_eq!(ticks[3].health, Health::Down);

        // Model ticks carry request statistics, the API tick does not
        assert_eq!(ticks[0].metrics, None);
        let asha = ticks[1].metrics.unwrap();
        assert_eq!(asha.avg_latency_ms, 812);
        assert!((asha.fail_pct - 1.0).abs() < 1e-9);
        assert_eq!(ticks[3].metrics.unwrap().timeout_pct, 100.0);
    }

    #[test]
    fn test_bad_timestamp_falls_back_to_now() {
        let body = r#"{"history": [{"updated": "yesterday", "api": "red"}]}"#;
        let snapshot = parse_status_document(body, now()).unwrap();
        assert_eq!(snapshot.taken_at, now());
        assert_eq!(snapshot.api_health, Some(Health::Down));
        assert!(snapshot.models.is_empty());
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(
            parse_status_document("{}", now()),
            Err(FetchError::Parse(_))
        ));
        assert!(matches!(
            parse_status_document("<html>", now()),
            Err(FetchError::Parse(_))
        ));
    }
}
