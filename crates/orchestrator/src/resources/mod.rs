//! RAII guards for operation workers.
//!
//! - [`OperationGuard`] - Fails the task and phase of a worker that stops without finishing

mod operation_guard;

pub use operation_guard::OperationGuard;
