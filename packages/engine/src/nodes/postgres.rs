//! PostgreSQL-backed node store.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};

use super::model::InfrastructureNode;
use super::store::NodeStore;

pub struct PostgresNodeStore {
    pool: PgPool,
}

impl PostgresNodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeStore for PostgresNodeStore {
    async fn create(&self, node: &InfrastructureNode) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO infrastructure_nodes (
                node_id, node_name, node_type, internal_ip, public_ip, runtime_agent_url,
                supported_runtimes, total_cpu, total_memory, total_storage,
                available_cpu, available_memory, available_storage,
                max_containers, active_containers, status, health_status,
                last_heartbeat_at, labels, created_at, registered_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10,
                $11, $12, $13,
                $14, $15, $16, $17,
                $18, $19, $20, $21
            )
            "#,
        )
        .bind(node.node_id)
        .bind(&node.node_name)
        .bind(node.node_type)
        .bind(&node.internal_ip)
        .bind(&node.public_ip)
        .bind(&node.runtime_agent_url)
        .bind(&node.supported_runtimes)
        .bind(node.total_cpu)
        .bind(node.total_memory)
        .bind(node.total_storage)
        .bind(node.available_cpu)
        .bind(node.available_memory)
        .bind(node.available_storage)
        .bind(node.max_containers)
        .bind(node.active_containers)
        .bind(node.status)
        .bind(node.health_status)
        .bind(node.last_heartbeat_at)
        .bind(&node.labels)
        .bind(node.created_at)
        .bind(node.registered_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                EngineError::AlreadyExists(format!("node {}", node.node_name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, node_id: Uuid) -> EngineResult<Option<InfrastructureNode>> {
        let node = sqlx::query_as::<_, InfrastructureNode>(
            r#"
            SELECT node_id, node_name, node_type, internal_ip, public_ip, runtime_agent_url,
                   supported_runtimes, total_cpu, total_memory, total_storage,
                   available_cpu, available_memory, available_storage,
                   max_containers, active_containers, status, health_status,
                   last_heartbeat_at, labels, created_at, registered_at
            FROM infrastructure_nodes
            WHERE node_id = $1
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(node)
    }

    async fn get_by_name(&self, node_name: &str) -> EngineResult<Option<InfrastructureNode>> {
        let node = sqlx::query_as::<_, InfrastructureNode>(
            r#"
            SELECT node_id, node_name, node_type, internal_ip, public_ip, runtime_agent_url,
                   supported_runtimes, total_cpu, total_memory, total_storage,
                   available_cpu, available_memory, available_storage,
                   max_containers, active_containers, status, health_status,
                   last_heartbeat_at, labels, created_at, registered_at
            FROM infrastructure_nodes
            WHERE node_name = $1
            "#,
        )
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(node)
    }

    async fn list_available(
        &self,
        runtime: Option<&str>,
    ) -> EngineResult<Vec<InfrastructureNode>> {
        let nodes = sqlx::query_as::<_, InfrastructureNode>(
            r#"
            SELECT node_id, node_name, node_type, internal_ip, public_ip, runtime_agent_url,
                   supported_runtimes, total_cpu, total_memory, total_storage,
                   available_cpu, available_memory, available_storage,
                   max_containers, active_containers, status, health_status,
                   last_heartbeat_at, labels, created_at, registered_at
            FROM infrastructure_nodes
            WHERE status = 'READY'
              AND health_status IN ('HEALTHY', 'UNKNOWN')
              AND ($1::TEXT IS NULL OR $1 = ANY(supported_runtimes))
            ORDER BY active_containers ASC
            "#,
        )
        .bind(runtime)
        .fetch_all(&self.pool)
        .await?;

        Ok(nodes)
    }

    async fn list_all(&self) -> EngineResult<Vec<InfrastructureNode>> {
        let nodes = sqlx::query_as::<_, InfrastructureNode>(
            r#"
            SELECT node_id, node_name, node_type, internal_ip, public_ip, runtime_agent_url,
                   supported_runtimes, total_cpu, total_memory, total_storage,
                   available_cpu, available_memory, available_storage,
                   max_containers, active_containers, status, health_status,
                   last_heartbeat_at, labels, created_at, registered_at
            FROM infrastructure_nodes
            ORDER BY node_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(nodes)
    }

    async fn update(&self, node: &InfrastructureNode) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE infrastructure_nodes SET
                node_type = $2, internal_ip = $3, public_ip = $4, runtime_agent_url = $5,
                supported_runtimes = $6, total_cpu = $7, total_memory = $8, total_storage = $9,
                available_cpu = $10, available_memory = $11, available_storage = $12,
                max_containers = $13, active_containers = $14, status = $15,
                health_status = $16, last_heartbeat_at = $17, labels = $18
            WHERE node_id = $1
            "#,
        )
        .bind(node.node_id)
        .bind(node.node_type)
        .bind(&node.internal_ip)
        .bind(&node.public_ip)
        .bind(&node.runtime_agent_url)
        .bind(&node.supported_runtimes)
        .bind(node.total_cpu)
        .bind(node.total_memory)
        .bind(node.total_storage)
        .bind(node.available_cpu)
        .bind(node.available_memory)
        .bind(node.available_storage)
        .bind(node.max_containers)
        .bind(node.active_containers)
        .bind(node.status)
        .bind(node.health_status)
        .bind(node.last_heartbeat_at)
        .bind(&node.labels)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("node {}", node.node_id)));
        }
        Ok(())
    }
}
