//! Network reachability.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::observers::{Listener, ObserverHandle, ObserverRegistry};

/// Coarse class of the active network, used to pick a flush interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    /// Wi-Fi, ethernet: cheap to use.
    #[default]
    Unmetered,
    /// Cellular: batch harder.
    Metered,
    /// No usable network.
    Offline,
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkClass::Unmetered => write!(f, "unmetered"),
            NetworkClass::Metered => write!(f, "metered"),
            NetworkClass::Offline => write!(f, "offline"),
        }
    }
}

/// Host-supplied reachability.
///
/// Listeners receive `true` on a disconnected→connected transition and
/// `false` on the reverse.
pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;

    fn network_class(&self) -> NetworkClass;

    fn on_network_change(&self, listener: Listener<bool>) -> ObserverHandle;

    fn off_network_change(&self, handle: ObserverHandle);
}

/// Reachability driven by explicit calls from the host (or a test).
#[derive(Debug)]
pub struct ManualNetworkMonitor {
    connected: AtomicBool,
    class: Mutex<NetworkClass>,
    observers: ObserverRegistry<bool>,
}

impl ManualNetworkMonitor {
    pub fn new(connected: bool) -> Self {
        ManualNetworkMonitor {
            connected: AtomicBool::new(connected),
            class: Mutex::new(NetworkClass::default()),
            observers: ObserverRegistry::new(),
        }
    }

    /// Reports a connectivity change. Listeners fire only on transitions.
    pub fn set_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::SeqCst);
        if previous != connected {
            debug!(connected, "Network connectivity changed");
            self.observers.notify(&connected);
        }
    }

    pub fn set_class(&self, class: NetworkClass) {
        *self.class.lock() = class;
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn network_class(&self) -> NetworkClass {
        *self.class.lock()
    }

    fn on_network_change(&self, listener: Listener<bool>) -> ObserverHandle {
        self.observers.register(listener)
    }

    fn off_network_change(&self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }
}
