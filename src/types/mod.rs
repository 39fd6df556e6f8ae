//! Core domain types.
//!
//! Identifiers, profiles and events: the values producers hand to the
//! delivery engine.

pub mod event;
pub mod ids;
pub mod profile;

pub use event::Event;
pub use ids::{ApiKey, RequestId};
pub use profile::{Profile, ProfileKey};
