//! Gateway to the remote container runtime.
//!
//! Everything that talks to a runtime agent goes through this trait so the
//! executor and health monitor can run against a stub in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use runtime_agent::{AgentClient, AgentError, ContainerStatus, DeployResult, ExecResult};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Operations the platform needs from a runtime agent, addressed by the
/// agent's URL (one agent per node).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn deploy(
        &self,
        execution_id: Uuid,
        agent_url: &str,
        container_spec: &serde_json::Value,
    ) -> Result<DeployResult, AgentError>;

    async fn container_status(
        &self,
        agent_url: &str,
        container_id: &str,
    ) -> Result<ContainerStatus, AgentError>;

    async fn stop_container(&self, agent_url: &str, container_id: &str)
        -> Result<(), AgentError>;

    async fn remove_container(
        &self,
        agent_url: &str,
        container_id: &str,
        force: bool,
    ) -> Result<(), AgentError>;

    async fn restart_container(
        &self,
        agent_url: &str,
        container_id: &str,
    ) -> Result<(), AgentError>;

    async fn exec(
        &self,
        agent_url: &str,
        container_id: &str,
        command: &str,
    ) -> Result<ExecResult, AgentError>;
}

/// HTTP gateway over [`runtime_agent::AgentClient`], with one cached
/// client per agent URL.
#[derive(Default)]
pub struct HttpRuntime {
    clients: Mutex<HashMap<String, AgentClient>>,
}

impl HttpRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, agent_url: &str) -> AgentClient {
        let mut clients = self.clients.lock().await;
        clients
            .entry(agent_url.to_string())
            .or_insert_with(|| AgentClient::new(agent_url))
            .clone()
    }
}

#[async_trait]
impl ContainerRuntime for HttpRuntime {
    async fn deploy(
        &self,
        execution_id: Uuid,
        agent_url: &str,
        container_spec: &serde_json::Value,
    ) -> Result<DeployResult, AgentError> {
        let client = self.client(agent_url).await;

        if !client.health_check().await {
            return Err(AgentError::Transient(format!(
                "runtime agent at {} is not healthy or unreachable",
                agent_url
            )));
        }

        let result = client.deploy_container(execution_id, container_spec).await?;
        info!(
            execution_id = %execution_id,
            container_id = %result.container_id,
            "container deployed"
        );
        Ok(result)
    }

    async fn container_status(
        &self,
        agent_url: &str,
        container_id: &str,
    ) -> Result<ContainerStatus, AgentError> {
        self.client(agent_url)
            .await
            .get_container_status(container_id)
            .await
    }

    async fn stop_container(
        &self,
        agent_url: &str,
        container_id: &str,
    ) -> Result<(), AgentError> {
        self.client(agent_url).await.stop_container(container_id).await
    }

    async fn remove_container(
        &self,
        agent_url: &str,
        container_id: &str,
        force: bool,
    ) -> Result<(), AgentError> {
        self.client(agent_url)
            .await
            .remove_container(container_id, force)
            .await
    }

    async fn restart_container(
        &self,
        agent_url: &str,
        container_id: &str,
    ) -> Result<(), AgentError> {
        self.client(agent_url)
            .await
            .restart_container(container_id)
            .await
    }

    async fn exec(
        &self,
        agent_url: &str,
        container_id: &str,
        command: &str,
    ) -> Result<ExecResult, AgentError> {
        self.client(agent_url)
            .await
            .exec(container_id, command, None)
            .await
    }
}
