//! Batch delivery of queued requests.
//!
//! A single Tokio task ([`BatchScheduler::run`]) serializes every drain
//! pass. Producers, host monitors and deferred timers talk to it only
//! through a [`SchedulerHandle`], so none of them ever waits on the network.
//!
//! # Module Structure
//!
//! - [`message`]: scheduler messages and the sending handle
//! - [`backoff`]: flush and retry intervals
//! - [`batch`]: the pass logic and event loop

mod backoff;
mod batch;
mod message;

#[cfg(test)]
mod tests;

pub use backoff::Backoff;
pub use batch::BatchScheduler;
pub use message::{SchedulerHandle, SchedulerMessage};
