//! Analytics Courier - durable, batched delivery of analytics requests.
//!
//! Producers queue profile updates, push token registrations and tracked
//! events; a single scheduler task drains the persistent queue in batches,
//! retrying rate-limited requests with backoff and surviving restarts.
//! Rapid profile mutations are debounced into one request.
//!
//! Start with [`Courier::start`].

pub mod client;
pub mod config;
pub mod courier;
pub mod host;
pub mod observers;
pub mod profile;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::CourierConfig;
pub use courier::{Courier, CourierError, HostCapabilities};
