//! Fleet inventory: infrastructure nodes and capacity-aware selection.

mod model;
mod postgres;
mod registry;
mod store;

pub use model::{InfrastructureNode, NodeHealth, NodeStatus, NodeType};
pub use postgres::PostgresNodeStore;
pub use registry::NodeRegistry;
pub use store::NodeStore;
