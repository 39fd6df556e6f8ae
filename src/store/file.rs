//! File-backed store: one `<key>.json` file per entry.
//!
//! # Durability
//!
//! Writes go to `<key>.json.tmp`, are fsynced, renamed over the target and
//! then the directory is fsynced, so a crash leaves either the old value or
//! the new one. Clears fsync the directory after unlinking.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use super::{DataStore, Result, StoreChange, StoreError};
use crate::observers::{Listener, ObserverHandle, ObserverRegistry};

const ENTRY_EXTENSION: &str = "json";

/// A [`DataStore`] persisted under a directory.
#[derive(Debug)]
pub struct FileDataStore {
    dir: PathBuf,
    observers: ObserverRegistry<StoreChange>,
}

impl FileDataStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileDataStore {
            dir,
            observers: ObserverRegistry::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.{ENTRY_EXTENSION}")))
    }
}

/// Keys become file names, so only `[A-Za-z0-9_-]` is accepted.
///
/// That covers hyphenated UUIDs and the snake_case property keys while
/// ruling out separators, dots and traversal.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Without this a fresh rename or unlink may not survive power loss.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

impl DataStore for FileDataStore {
    fn fetch(&self, key: &str) -> Result<Option<String>> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::NotText {
                    key: key.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        let tmp_path = path.with_extension(format!("{ENTRY_EXTENSION}.tmp"));

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(value.as_bytes())?;
            fsync_file(&file)?;
        }

        fs::rename(&tmp_path, &path)?;
        fsync_dir(&self.dir)?;
        trace!(key, bytes = value.len(), "Stored entry");

        self.observers.notify(&StoreChange {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                fsync_dir(&self.dir)?;
                trace!(key, "Cleared entry");
                self.observers.notify(&StoreChange {
                    key: key.to_string(),
                    value: None,
                });
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn on_store_change(&self, listener: Listener<StoreChange>) -> ObserverHandle {
        self.observers.register(listener)
    }

    fn off_store_change(&self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }
}
