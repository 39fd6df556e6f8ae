//! Durable key→string storage.
//!
//! The request queue mirrors itself into a [`DataStore`] (one entry per
//! request plus an index), and profile state persists each field under its
//! own key. Two implementations are provided:
//!
//! - [`InMemoryDataStore`]: process-local, for tests and ephemeral hosts
//! - [`FileDataStore`]: one file per key with atomic, fsynced replacement

mod file;
mod memory;

pub use file::FileDataStore;
pub use memory::InMemoryDataStore;

use std::io;

use thiserror::Error;

use crate::observers::{Listener, ObserverHandle};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error while reading or writing an entry.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Stored bytes were not valid UTF-8 text.
    #[error("entry {key} is not valid UTF-8")]
    NotText { key: String },

    /// Key cannot be mapped safely onto the backing medium.
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Notification that one key was written or cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    /// The new value, or `None` when the key was cleared.
    pub value: Option<String>,
}

/// Persistent key→string map with change notification.
pub trait DataStore: Send + Sync {
    fn fetch(&self, key: &str) -> Result<Option<String>>;

    fn store(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Clearing a missing key succeeds.
    fn clear(&self, key: &str) -> Result<()>;

    fn on_store_change(&self, listener: Listener<StoreChange>) -> ObserverHandle;

    fn off_store_change(&self, handle: ObserverHandle);
}
