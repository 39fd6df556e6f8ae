//! Store-backed values with lazy load and write-through.
//!
//! A [`PersistentProperty`] reads its key from the [`DataStore`] the first
//! time it is accessed and caches the result. If the store has nothing, the
//! codec's fallback (if any) is generated and persisted so later runs see
//! the same value. Sets write through; a value that serializes to the empty
//! string clears the key instead.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::DataStore;

/// How one property is represented in the store.
pub trait PropertyCodec: Send + Sync {
    type Value: Clone + PartialEq + Send + Sync;

    /// Value used when nothing is stored and there is no fallback.
    fn default_value(&self) -> Self::Value;

    /// Value generated and persisted when nothing is stored.
    fn fallback(&self) -> Option<Self::Value> {
        None
    }

    /// Serialized form. An empty string means "clear the key".
    fn encode(&self, value: &Self::Value) -> String;

    fn decode(&self, raw: &str) -> Option<Self::Value>;
}

/// Plain text; empty means unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl PropertyCodec for TextCodec {
    type Value = String;

    fn default_value(&self) -> String {
        String::new()
    }

    fn encode(&self, value: &String) -> String {
        value.clone()
    }

    fn decode(&self, raw: &str) -> Option<String> {
        Some(raw.to_string())
    }
}

/// Text that falls back to a fresh UUID v4.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratedIdCodec;

impl PropertyCodec for GeneratedIdCodec {
    type Value = String;

    fn default_value(&self) -> String {
        String::new()
    }

    fn fallback(&self) -> Option<String> {
        Some(Uuid::new_v4().to_string())
    }

    fn encode(&self, value: &String) -> String {
        value.clone()
    }

    fn decode(&self, raw: &str) -> Option<String> {
        Some(raw.to_string())
    }
}

/// A JSON object; empty means unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectCodec;

impl PropertyCodec for ObjectCodec {
    type Value = Map<String, Value>;

    fn default_value(&self) -> Map<String, Value> {
        Map::new()
    }

    fn encode(&self, value: &Map<String, Value>) -> String {
        if value.is_empty() {
            String::new()
        } else {
            Value::Object(value.clone()).to_string()
        }
    }

    fn decode(&self, raw: &str) -> Option<Map<String, Value>> {
        match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// One persisted field.
pub struct PersistentProperty<C: PropertyCodec> {
    key: &'static str,
    codec: C,
    store: Arc<dyn DataStore>,
    cached: Mutex<Option<C::Value>>,
    /// Serializes writers across compare, persist and cache update. Store
    /// listeners run under it and must not write this property.
    write: Mutex<()>,
}

impl<C: PropertyCodec> PersistentProperty<C> {
    pub fn new(key: &'static str, codec: C, store: Arc<dyn DataStore>) -> Self {
        PersistentProperty {
            key,
            codec,
            store,
            cached: Mutex::new(None),
            write: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Current value, loading it from the store on first access.
    pub fn get(&self) -> C::Value {
        if let Some(value) = self.cached.lock().clone() {
            return value;
        }
        // Loading may persist a fallback, which notifies store listeners;
        // the cache lock must not be held across that.
        let value = self.load();
        *self.cached.lock() = Some(value.clone());
        value
    }

    /// Replaces the value. Returns false, changing nothing, if it is equal
    /// to the current one.
    pub fn set(&self, value: C::Value) -> bool {
        let _write = self.write.lock();
        if self.get() == value {
            debug!(key = self.key, "Ignored update, value is unchanged");
            return false;
        }
        self.persist(&value);
        *self.cached.lock() = Some(value);
        true
    }

    /// Clears the stored value. The next read loads afresh (and so may
    /// generate a new fallback).
    pub fn reset(&self) {
        let _write = self.write.lock();
        self.persist(&self.codec.default_value());
        *self.cached.lock() = None;
    }

    /// Drops the cached value so the next read goes to the store.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    fn load(&self) -> C::Value {
        match self.store.fetch(self.key) {
            Ok(Some(raw)) if !raw.is_empty() => match self.codec.decode(&raw) {
                Some(value) => value,
                None => {
                    warn!(key = self.key, "Stored value could not be decoded, discarding");
                    self.fallback_or_default()
                }
            },
            Ok(_) => self.fallback_or_default(),
            Err(e) => {
                warn!(key = self.key, error = %e, "Failed to read stored value");
                self.codec.default_value()
            }
        }
    }

    fn fallback_or_default(&self) -> C::Value {
        match self.codec.fallback() {
            Some(value) => {
                self.persist(&value);
                value
            }
            None => self.codec.default_value(),
        }
    }

    fn persist(&self, value: &C::Value) {
        let serialized = self.codec.encode(value);
        let result = if serialized.is_empty() {
            self.store.clear(self.key)
        } else {
            self.store.store(self.key, &serialized)
        };
        if let Err(e) = result {
            warn!(key = self.key, error = %e, "Failed to persist value");
        }
    }
}

impl<C: PropertyCodec> fmt::Debug for PersistentProperty<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentProperty")
            .field("key", &self.key)
            .field("loaded", &self.cached.lock().is_some())
            .finish()
    }
}
