//! Monitor configuration
//!
//! Loaded once at startup and passed by value to each component.
//!
//! Environment variables:
//! - STATUSWATCH_CONFIG: JSON config file; scalar variables below override it
//! - STATUSWATCH_HOST / STATUSWATCH_PORT: API bind address (default 0.0.0.0:8080)
//! - STATUSWATCH_ENDPOINT: upstream status document URL
//! - STATUSWATCH_DATA_DIR: persistence directory
//! - STATUSWATCH_POLL_INTERVAL_SECS, STATUSWATCH_HISTORY_DEPTH
//! - STATUSWATCH_DOWN_THRESHOLD, STATUSWATCH_UP_THRESHOLD
//! - STATUSWATCH_DEBOUNCE_COOLDOWN_SECS, STATUSWATCH_RETRY_MAX,
//!   STATUSWATCH_RETRY_BACKOFF_BASE_SECS
//! - STATUSWATCH_DISCORD_TOKEN / STATUSWATCH_GUILD_ID: platform credentials

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::alerts::{AlertChannelConfig, Thresholds};
use crate::data::{default_entities, MonitoredEntity};
use crate::storage::persistence::validate_key;
use crate::storage::{PersistenceConfig, Store, DEFAULT_HISTORY_DEPTH};
use crate::subscriptions::RegistryConfig;

pub const DEFAULT_ENDPOINT: &str = "https://gateway.chub.ai/monitoring/health/public/status";

const ENV_PREFIX: &str = "STATUSWATCH_";

/// Upper bound for every interval and the debounce cooldown
const MAX_INTERVAL_SECS: u64 = 86_400;
/// Upper bound for the first role retry backoff
const MAX_BACKOFF_BASE_SECS: f64 = 60.0;
const MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub history_depth: usize,
    pub down_threshold: u32,
    pub up_threshold: u32,
    pub debounce_cooldown_secs: u64,
    pub retry_max: u32,
    pub retry_backoff_base_secs: f64,
    /// How often the role reconcile sweep runs
    pub reconcile_interval_secs: u64,
    pub upstream_endpoint: String,
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub entities: Vec<MonitoredEntity>,
    pub channels: Vec<AlertChannelConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            history_depth: DEFAULT_HISTORY_DEPTH,
            down_threshold: Thresholds::default().down,
            up_threshold: Thresholds::default().up,
            debounce_cooldown_secs: 30,
            retry_max: 3,
            retry_backoff_base_secs: 1.0,
            reconcile_interval_secs: 60,
            upstream_endpoint: DEFAULT_ENDPOINT.to_string(),
            data_dir: PersistenceConfig::default().data_dir,
            host: "0.0.0.0".to_string(),
            port: 8080,
            entities: default_entities(),
            channels: Vec::new(),
        }
    }
}

/// Platform credentials; never read from the config file
#[derive(Debug, Clone)]
pub struct PlatformCredentials {
    pub token: String,
    pub guild_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl MonitorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Config file from `STATUSWATCH_CONFIG` (if set), then scalar env overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        let mut config = match var("CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        override_from(&var, "POLL_INTERVAL_SECS", &mut config.poll_interval_secs)?;
        override_from(&var, "HISTORY_DEPTH", &mut config.history_depth)?;
        override_from(&var, "DOWN_THRESHOLD", &mut config.down_threshold)?;
        override_from(&var, "UP_THRESHOLD", &mut config.up_threshold)?;
        override_from(&var, "DEBOUNCE_COOLDOWN_SECS", &mut config.debounce_cooldown_secs)?;
        override_from(&var, "RETRY_MAX", &mut config.retry_max)?;
        override_from(&var, "RETRY_BACKOFF_BASE_SECS", &mut config.retry_backoff_base_secs)?;
        override_from(&var, "RECONCILE_INTERVAL_SECS", &mut config.reconcile_interval_secs)?;
        override_from(&var, "PORT", &mut config.port)?;
        if let Some(host) = var("HOST") {
            config.host = host;
        }
        if let Some(endpoint) = var("ENDPOINT") {
            config.upstream_endpoint = endpoint;
        }
        if let Some(dir) = var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Discord credentials, if both are present in the environment
    pub fn credentials_from_env() -> Option<PlatformCredentials> {
        let token = std::env::var(format!("{}DISCORD_TOKEN", ENV_PREFIX)).ok()?;
        let guild_id = std::env::var(format!("{}GUILD_ID", ENV_PREFIX)).ok()?;
        if token.trim().is_empty() || guild_id.trim().is_empty() {
            return None;
        }
        Some(PlatformCredentials { token, guild_id })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be > 0".into()));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid("reconcile_interval_secs must be > 0".into()));
        }
        for (name, secs) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("debounce_cooldown_secs", self.debounce_cooldown_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {}",
                    name, MAX_INTERVAL_SECS
                )));
            }
        }
        if self.retry_max > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "retry_max must be at most {}",
                MAX_RETRIES
            )));
        }
        if self.history_depth == 0 {
            return Err(ConfigError::Invalid("history_depth must be > 0".into()));
        }
        if self.down_threshold == 0 || self.up_threshold == 0 {
            return Err(ConfigError::Invalid("thresholds must be > 0".into()));
        }
        if !self.retry_backoff_base_secs.is_finite()
            || !(0.0..=MAX_BACKOFF_BASE_SECS).contains(&self.retry_backoff_base_secs)
        {
            return Err(ConfigError::Invalid(format!(
                "retry_backoff_base_secs must be between 0 and {}",
                MAX_BACKOFF_BASE_SECS
            )));
        }
        if self.entities.is_empty() {
            return Err(ConfigError::Invalid("no entities configured".into()));
        }

        let mut ids = HashSet::new();
        for entity in &self.entities {
            if !ids.insert(entity.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate entity '{}'", entity.id)));
            }
            if entity.id.is_empty() || validate_key(&Store::history_key(&entity.id)).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "entity id '{}' may only contain ASCII letters, digits, '.', '_' and '-'",
                    entity.id
                )));
            }
        }

        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.channel_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel '{}'",
                    channel.channel_id
                )));
            }
            if channel.channel_id.is_empty()
                || validate_key(&Store::channel_key(&channel.channel_id)).is_err()
            {
                return Err(ConfigError::Invalid(format!(
                    "channel id '{}' may only contain ASCII letters, digits, '.', '_' and '-'",
                    channel.channel_id
                )));
            }
            for entity in channel.entities.iter().flatten() {
                if !ids.contains(entity.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "channel '{}' routes unknown entity '{}'",
                        channel.channel_id, entity
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn with_entities(mut self, entities: Vec<MonitoredEntity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_channel(mut self, channel: AlertChannelConfig) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_base_secs.max(0.0))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            down: self.down_threshold,
            up: self.up_threshold,
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            cooldown: chrono::Duration::seconds(self.debounce_cooldown_secs as i64),
            retry_max: self.retry_max,
            backoff_base: self.retry_backoff_base(),
        }
    }

    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig::new(&self.data_dir)
    }
}

fn override_from<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = var(name) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            var: format!("{}{}", ENV_PREFIX, name),
            value,
        })?;
    }
    Ok(())
}
