#![deny(unsafe_code)]

//! Bounded, de-duplicated search history with durable JSON storage.

pub mod error;
pub mod repository;
pub mod store;

pub use error::{AtomicWriteError, HistoryError, HistoryResult};
pub use repository::{
    HistoryRepository, LIVE_HISTORY_LIMIT, PERSISTED_HISTORY_LIMIT, UpsertOutcome,
};
pub use store::{
    HistorySettings, HistoryStore, JsonFileHistoryStore, MemoryHistoryStore, PersistedHistory,
    write_file_atomically,
};
