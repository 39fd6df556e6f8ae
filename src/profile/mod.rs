//! Profile state and its translation into requests.
//!
//! - [`persistent`]: lazily loaded, write-through store fields
//! - [`state`]: the persisted profile and its change broadcasts
//! - [`coalescer`]: debounces changes into profile and push token requests

pub mod coalescer;
pub mod persistent;
pub mod state;

pub use coalescer::StateCoalescer;
pub use persistent::{GeneratedIdCodec, ObjectCodec, PersistentProperty, PropertyCodec, TextCodec};
pub use state::{ProfileState, StateChange, StateKey};
