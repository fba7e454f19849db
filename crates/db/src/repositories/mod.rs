mod cluster_repository;
mod task_repository;

pub use cluster_repository::*;
pub use task_repository::*;
