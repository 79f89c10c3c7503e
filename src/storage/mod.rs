pub mod history;
pub mod persistence;

pub use history::{HistoryError, HistoryStore, UptimeSummary, DEFAULT_HISTORY_DEPTH};
pub use persistence::{
    FileBackend, MemoryBackend, PersistenceBackend, PersistenceConfig, PersistenceError, Store,
};
