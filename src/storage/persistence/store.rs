//! Typed JSON records on top of a persistence backend

use super::{PersistenceBackend, PersistenceError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Key under which the scheduler keeps its last processed snapshot time
pub const SCHEDULER_KEY: &str = "scheduler";

/// Typed access to the durable store
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn PersistenceBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    pub fn history_key(entity_id: &str) -> String {
        format!("history.{}", entity_id)
    }

    pub fn alert_key(entity_id: &str) -> String {
        format!("alert.{}", entity_id)
    }

    pub fn channel_key(channel_id: &str) -> String {
        format!("channel.{}", channel_id)
    }

    /// Read and decode a record. Absence is `Ok(None)`, not an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        match self.backend.read(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PersistenceError::Deserialization(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Encode and atomically upsert a record
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| PersistenceError::Serialization(format!("{}: {}", key, e)))?;
        self.backend.write(key, &bytes)
    }

    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.backend.sync()
    }
}
