//! Durable key-value persistence for monitor state
//!
//! Every key is upserted atomically on its own. Components keep one key per entity or
//! channel so a crash never leaves a half-written record.

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use store::Store;

use std::path::Path;

/// Trait for persistence backends
pub trait PersistenceBackend: Send + Sync {
    /// Atomically replace the value stored under `key`
    fn write(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError>;

    /// Read data from persistence
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Sync to disk
    fn sync(&self) -> Result<(), PersistenceError>;
}

/// Keys map to file names, so only `[A-Za-z0-9._-]` is allowed and a leading dot is not
pub fn validate_key(key: &str) -> Result<(), PersistenceError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !key.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidKey(key.to_string()))
    }
}

/// Persistence configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Base directory for persistence files
    pub data_dir: std::path::PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: std::path::PathBuf::from("./statuswatch_data"),
        }
    }
}

impl PersistenceConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
