//! Node registry: registration, selection, capacity, and liveness.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};

use super::model::{InfrastructureNode, NodeHealth, NodeStatus};
use super::store::NodeStore;

/// Nodes with less than this many cores free are flipped to FULL.
const MIN_SCHEDULABLE_CPU: f64 = 0.5;

/// Fleet inventory service with least-loaded first-fit selection.
///
/// The policy is deliberately simple: no packing, no locality preferences.
/// It is the simplest policy under which capacity updates converge
/// monotonically.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    /// Register a new node, marking it READY and HEALTHY with a fresh
    /// heartbeat. Duplicate names are rejected.
    pub async fn register(&self, mut node: InfrastructureNode) -> EngineResult<InfrastructureNode> {
        if node.runtime_agent_url.is_empty() {
            return Err(EngineError::Validation("runtime_agent_url required".into()));
        }
        if node.internal_ip.is_empty() {
            return Err(EngineError::Validation("internal_ip required".into()));
        }

        node.status = NodeStatus::Ready;
        node.health_status = NodeHealth::Healthy;
        node.last_heartbeat_at = Some(Utc::now());

        self.store.create(&node).await?;
        info!(node_id = %node.node_id, node_name = %node.node_name, "registered node");
        Ok(node)
    }

    pub async fn get(&self, node_id: Uuid) -> EngineResult<Option<InfrastructureNode>> {
        self.store.get(node_id).await
    }

    pub async fn get_by_name(&self, node_name: &str) -> EngineResult<Option<InfrastructureNode>> {
        self.store.get_by_name(node_name).await
    }

    pub async fn list_available(
        &self,
        runtime: Option<&str>,
    ) -> EngineResult<Vec<InfrastructureNode>> {
        self.store.list_available(runtime).await
    }

    /// Least-loaded node with sufficient capacity, or None.
    ///
    /// Candidates come back ordered by `active_containers` ascending, so
    /// the first one that fits is the least loaded fit.
    pub async fn select(
        &self,
        runtime: &str,
        required_cpu: f64,
        required_memory: i64,
        required_storage: i64,
    ) -> EngineResult<Option<InfrastructureNode>> {
        let candidates = self.store.list_available(Some(runtime)).await?;

        let selected = candidates
            .into_iter()
            .find(|node| node.can_accommodate(required_cpu, required_memory, required_storage));

        match &selected {
            Some(node) => {
                info!(node_id = %node.node_id, node_name = %node.node_name, "selected node")
            }
            None => warn!(runtime = %runtime, "no suitable node for request"),
        }

        Ok(selected)
    }

    /// Rewrite availability as reported by the node's agent, flipping the
    /// node FULL when it hits its container cap or runs out of schedulable
    /// CPU, and back to READY when capacity returns.
    pub async fn update_capacity(
        &self,
        node_id: Uuid,
        available_cpu: f64,
        available_memory: i64,
        available_storage: i64,
        active_containers: i32,
    ) -> EngineResult<()> {
        let mut node = self
            .store
            .get(node_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("node {}", node_id)))?;

        node.update_capacity(
            available_cpu,
            available_memory,
            available_storage,
            active_containers,
        );

        node.status = if active_containers >= node.max_containers
            || available_cpu < MIN_SCHEDULABLE_CPU
        {
            NodeStatus::Full
        } else {
            NodeStatus::Ready
        };

        self.store.update(&node).await
    }

    pub async fn report_heartbeat(&self, node_id: Uuid, health: NodeHealth) -> EngineResult<()> {
        let mut node = self
            .store
            .get(node_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("node {}", node_id)))?;

        node.health_status = health;
        node.last_heartbeat_at = Some(Utc::now());
        self.store.update(&node).await
    }

    /// Mark nodes whose last heartbeat is older than `threshold` as
    /// OFFLINE and UNHEALTHY. Returns the nodes that went stale.
    pub async fn check_stale(&self, threshold: Duration) -> EngineResult<Vec<InfrastructureNode>> {
        let cutoff = Utc::now() - threshold;
        let mut stale = Vec::new();

        for mut node in self.store.list_all().await? {
            let expired = node
                .last_heartbeat_at
                .map_or(false, |heartbeat| heartbeat < cutoff);
            if !expired || node.status == NodeStatus::Offline {
                continue;
            }
            warn!(node_id = %node.node_id, node_name = %node.node_name, "node heartbeat stale, marking offline");
            node.status = NodeStatus::Offline;
            node.health_status = NodeHealth::Unhealthy;
            self.store.update(&node).await?;
            stale.push(node);
        }

        Ok(stale)
    }
}
