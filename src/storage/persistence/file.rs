//! File-per-key backend with atomic replace

use super::{validate_key, PersistenceBackend, PersistenceConfig, PersistenceError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

const EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "tmp";

/// Stores each key as `<data_dir>/<key>.json`
pub struct FileBackend {
    config: PersistenceConfig,
    /// Serializes writers so two upserts of one key never share a temp file
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(config: PersistenceConfig) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        validate_key(key)?;
        Ok(self.config.data_dir.join(format!("{}.{}", key, EXTENSION)))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.config.data_dir.join(format!("{}.{}", key, TMP_EXTENSION))
    }
}

impl PersistenceBackend for FileBackend {
    fn write(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        let path = self.key_path(key)?;
        let tmp = self.tmp_path(key);

        let _guard = self.write_lock.lock();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &path)?;

        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.key_path(key)?;

        if !path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(path)?;
        Ok(Some(data))
    }

    fn sync(&self) -> Result<(), PersistenceError> {
        // Directory fsync makes completed renames durable
        File::open(&self.config.data_dir)?.sync_all()?;
        Ok(())
    }
}
