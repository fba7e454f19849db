//! Event bus and event types for cluster lifecycle notifications.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
