//! Infrastructure node model (a server or VM running containers).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    AppNode,
    DbNode,
    EdgeNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Ready,
    Full,
    Maintenance,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_health", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Compute target. Capacity fields are reported by the node's agent via
/// heartbeats; deployments reserve pessimistically through selection but
/// never decrement them directly.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct InfrastructureNode {
    #[builder(default = Uuid::new_v4())]
    pub node_id: Uuid,
    pub node_name: String,
    #[builder(default = NodeType::AppNode)]
    pub node_type: NodeType,

    pub internal_ip: String,
    #[builder(default, setter(strip_option))]
    pub public_ip: Option<String>,
    pub runtime_agent_url: String,

    #[builder(default = vec!["docker".to_string()])]
    pub supported_runtimes: Vec<String>,

    // Capacity: cores, MB, GB
    #[builder(default = 0.0)]
    pub total_cpu: f64,
    #[builder(default = 0)]
    pub total_memory: i64,
    #[builder(default = 0)]
    pub total_storage: i64,
    #[builder(default = 0.0)]
    pub available_cpu: f64,
    #[builder(default = 0)]
    pub available_memory: i64,
    #[builder(default = 0)]
    pub available_storage: i64,

    #[builder(default = 50)]
    pub max_containers: i32,
    #[builder(default = 0)]
    pub active_containers: i32,

    #[builder(default = NodeStatus::Ready)]
    pub status: NodeStatus,
    #[builder(default = NodeHealth::Unknown)]
    pub health_status: NodeHealth,

    #[builder(default, setter(strip_option))]
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    #[builder(default = serde_json::json!({}))]
    pub labels: serde_json::Value,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub registered_at: DateTime<Utc>,
}

impl InfrastructureNode {
    pub fn update_capacity(
        &mut self,
        available_cpu: f64,
        available_memory: i64,
        available_storage: i64,
        active_containers: i32,
    ) {
        self.available_cpu = available_cpu;
        self.available_memory = available_memory;
        self.available_storage = available_storage;
        self.active_containers = active_containers;
    }

    pub fn can_accommodate(
        &self,
        required_cpu: f64,
        required_memory: i64,
        required_storage: i64,
    ) -> bool {
        self.available_cpu >= required_cpu
            && self.available_memory >= required_memory
            && self.available_storage >= required_storage
            && self.active_containers < self.max_containers
    }

    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Ready
            && matches!(self.health_status, NodeHealth::Healthy | NodeHealth::Unknown)
    }
}
