use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{DataStore, Result, StoreChange};
use crate::observers::{Listener, ObserverHandle, ObserverRegistry};

/// A [`DataStore`] held entirely in memory.
///
/// Can be switched into a failing mode to exercise I/O error paths.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    entries: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    observers: ObserverRegistry<StoreChange>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every write and clear fails with an IO error. Reads still work.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Copy of every entry, for assertions.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("store unavailable").into());
        }
        Ok(())
    }
}

impl DataStore for InMemoryDataStore {
    fn fetch(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        self.observers.notify(&StoreChange {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        let removed = self.entries.lock().remove(key);
        if removed.is_some() {
            self.observers.notify(&StoreChange {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    fn on_store_change(&self, listener: Listener<StoreChange>) -> ObserverHandle {
        self.observers.register(listener)
    }

    fn off_store_change(&self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }
}
