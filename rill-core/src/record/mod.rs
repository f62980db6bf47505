//! Versioned record writes
//!
//! Every write to a record name goes through that name's transition, which
//! applies steps strictly in arrival order and persists each accepted version
//! to the cache and the storage.

pub mod handler;
pub mod json_path;
pub mod step;
pub mod transition;

pub use handler::{RecordHandler, SubscriptionBroadcaster};
pub use json_path::set_value;
pub use step::{TargetVersion, UpdateAction, UpdateStep};
pub use transition::{RecordCoordinator, TransitionHandle};
