//! Domain model for cluster lifecycle orchestration.
//!
//! Holds the persisted cluster record, the `OPERATION:STATUS` phase, nodes,
//! tasks and templates shared by the store, the orchestrator and the API.

pub mod domain;
mod error;
pub mod validation;

pub use domain::*;
pub use error::*;
pub use validation::{is_valid_cluster_name, validate_cluster_name, MAX_CLUSTER_NAME_LENGTH};
