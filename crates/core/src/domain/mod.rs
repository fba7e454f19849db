mod cluster;
mod node;
mod phase;
mod task;
mod template;

pub use cluster::*;
pub use node::*;
pub use phase::*;
pub use task::*;
pub use template::*;
