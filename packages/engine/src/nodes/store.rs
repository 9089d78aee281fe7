use async_trait::async_trait;
use uuid::Uuid;

use crate::common::EngineResult;

use super::model::InfrastructureNode;

/// Persistence for the fleet inventory.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Persist a new node; duplicate names are rejected with `AlreadyExists`.
    async fn create(&self, node: &InfrastructureNode) -> EngineResult<()>;

    async fn get(&self, node_id: Uuid) -> EngineResult<Option<InfrastructureNode>>;

    async fn get_by_name(&self, node_name: &str) -> EngineResult<Option<InfrastructureNode>>;

    /// Nodes that can take new work: READY, health HEALTHY or UNKNOWN,
    /// supporting `runtime` if given, ordered least-loaded first.
    async fn list_available(&self, runtime: Option<&str>)
        -> EngineResult<Vec<InfrastructureNode>>;

    async fn list_all(&self) -> EngineResult<Vec<InfrastructureNode>>;

    async fn update(&self, node: &InfrastructureNode) -> EngineResult<()>;
}
