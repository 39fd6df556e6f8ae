//! Application lifecycle notifications.

use std::fmt;

use tracing::debug;

use crate::observers::{Listener, ObserverHandle, ObserverRegistry};

/// Foreground/background transitions the scheduler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityEvent {
    /// The first screen of the app became visible.
    FirstStarted,
    /// Every screen stopped: the app is fully backgrounded.
    AllStopped,
}

impl fmt::Display for ActivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityEvent::FirstStarted => write!(f, "first_started"),
            ActivityEvent::AllStopped => write!(f, "all_stopped"),
        }
    }
}

/// Host-supplied lifecycle stream.
pub trait LifecycleMonitor: Send + Sync {
    fn on_activity_event(&self, listener: Listener<ActivityEvent>) -> ObserverHandle;

    fn off_activity_event(&self, handle: ObserverHandle);
}

/// Lifecycle stream driven by explicit [`ManualLifecycleMonitor::emit`] calls.
#[derive(Debug, Default)]
pub struct ManualLifecycleMonitor {
    observers: ObserverRegistry<ActivityEvent>,
}

impl ManualLifecycleMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ActivityEvent) {
        debug!(%event, "Activity event");
        self.observers.notify(&event);
    }
}

impl LifecycleMonitor for ManualLifecycleMonitor {
    fn on_activity_event(&self, listener: Listener<ActivityEvent>) -> ObserverHandle {
        self.observers.register(listener)
    }

    fn off_activity_event(&self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }
}
