//! Handle-based listener registries.
//!
//! Every change-notification stream in the crate (store changes, network
//! transitions, lifecycle events, request broadcasts, profile state changes)
//! is an [`ObserverRegistry`]. Subscribing returns an [`ObserverHandle`];
//! unsubscribing is by handle, never by comparing closures.
//!
//! Listeners are invoked outside the registry lock, so a listener may
//! subscribe, unsubscribe or trigger further notifications without
//! deadlocking.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Token identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverHandle(u64);

impl fmt::Display for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// A boxed listener as accepted by the public `on_*` methods.
pub type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

type SharedListener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of listeners for values of type `T`.
pub struct ObserverRegistry<T: ?Sized> {
    next_handle: AtomicU64,
    listeners: Mutex<Vec<(ObserverHandle, SharedListener<T>)>>,
}

impl<T: ?Sized> ObserverRegistry<T> {
    pub fn new() -> Self {
        ObserverRegistry {
            next_handle: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener and returns its handle.
    pub fn register(&self, listener: Listener<T>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((handle, Arc::from(listener)));
        handle
    }

    /// Removes a listener. Returns false if the handle was unknown.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    /// Invokes every listener, in registration order, with `value`.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<SharedListener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl<T: ?Sized> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for ObserverRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
