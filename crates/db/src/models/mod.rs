mod cluster;
mod task;

pub use cluster::ClusterRow;
pub use task::TaskRow;
