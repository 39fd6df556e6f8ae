//! Capabilities supplied by the host environment.
//!
//! The delivery engine never reads the system clock, polls reachability or
//! watches app visibility on its own; it consumes these traits. Each comes
//! with an implementation the host can drive directly, which is also what
//! the tests use.
//!
//! - [`clock`]: current time and cancellable delayed tasks
//! - [`network`]: reachability and network class
//! - [`lifecycle`]: foreground/background transitions

pub mod clock;
pub mod lifecycle;
pub mod network;

pub use clock::{Cancellable, Clock, ManualClock, Task, TokioClock};
pub use lifecycle::{ActivityEvent, LifecycleMonitor, ManualLifecycleMonitor};
pub use network::{ManualNetworkMonitor, NetworkClass, NetworkMonitor};
