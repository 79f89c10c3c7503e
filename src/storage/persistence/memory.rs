//! In-memory backend, used by tests and dry runs

use super::{PersistenceBackend, PersistenceError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Number of upcoming writes that fail with `Unavailable`
    failing_writes: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }
}

impl PersistenceBackend for MemoryBackend {
    fn write(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PersistenceError::Unavailable(format!(
                "injected write failure for {}",
                key
            )));
        }

        self.entries.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn sync(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
