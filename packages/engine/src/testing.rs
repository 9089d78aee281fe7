//! Test doubles: in-memory node and domain stores plus a scripted runtime
//! gateway. The integration suites wire these into an [`EngineKernel`] and
//! drive the real orchestrator, executor, and reconcilers against them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runtime_agent::{AgentError, ContainerStatus, DeployResult, ExecResult};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};
use crate::domain::{
    Application, ApplicationTemplate, DeployedResource, Deployment, DeploymentStatus,
    DomainStore, HealthStatus, ResourceType,
};
use crate::executions::InMemoryExecutionStore;
use crate::executor::ContainerRuntime;
use crate::kernel::EngineKernel;
use crate::nodes::{InfrastructureNode, NodeHealth, NodeStatus, NodeStore};

/// Kernel wired entirely in memory, for tests and local development.
pub fn in_memory_kernel(runtime: Arc<dyn ContainerRuntime>) -> EngineKernel {
    EngineKernel::new(
        Arc::new(InMemoryExecutionStore::new()),
        Arc::new(InMemoryNodeStore::new()),
        Arc::new(InMemoryDomainStore::new()),
        runtime,
    )
}

// ----------------------------------------------------------------------
// Stub runtime gateway
// ----------------------------------------------------------------------

/// Scripted [`ContainerRuntime`]. Deploy outcomes are popped from a queue
/// (successful default when the queue is empty), exec exit codes and
/// restart outcomes are settable, and every call is recorded.
pub struct StubRuntime {
    deploy_script: Mutex<VecDeque<Result<DeployResult, String>>>,
    exec_exit_code: Mutex<i64>,
    deploys: Mutex<Vec<Uuid>>,
    restarts: Mutex<Vec<String>>,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self {
            deploy_script: Mutex::new(VecDeque::new()),
            exec_exit_code: Mutex::new(0),
            deploys: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
        }
    }
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next deploy to return this result.
    pub async fn push_deploy_result(&self, result: DeployResult) {
        self.deploy_script.lock().await.push_back(Ok(result));
    }

    /// Script the next deploy to fail with a transient error message.
    pub async fn push_deploy_failure(&self, message: &str) {
        self.deploy_script
            .lock()
            .await
            .push_back(Err(message.to_string()));
    }

    /// Make subsequent command probes exit with this code.
    pub async fn set_exec_exit_code(&self, exit_code: i64) {
        *self.exec_exit_code.lock().await = exit_code;
    }

    /// Executions deployed so far, in order.
    pub async fn deploys(&self) -> Vec<Uuid> {
        self.deploys.lock().await.clone()
    }

    /// Container ids restarted so far, in order.
    pub async fn restarts(&self) -> Vec<String> {
        self.restarts.lock().await.clone()
    }

    pub fn success_result(container_id: &str, ports: &[(u16, u16)]) -> DeployResult {
        DeployResult {
            container_id: container_id.to_string(),
            container_name: container_id.to_string(),
            status: "running".to_string(),
            internal_ip: Some("172.17.0.2".to_string()),
            ports: ports
                .iter()
                .map(|(container_port, host_port)| (format!("{}/tcp", container_port), *host_port))
                .collect(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn deploy(
        &self,
        execution_id: Uuid,
        _agent_url: &str,
        container_spec: &serde_json::Value,
    ) -> Result<DeployResult, AgentError> {
        self.deploys.lock().await.push(execution_id);

        match self.deploy_script.lock().await.pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(AgentError::Transient(message)),
            None => {
                let name = container_spec
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("container");
                let mut result = Self::success_result(
                    &format!("c-{}", &execution_id.simple().to_string()[..8]),
                    &[(80, 8080)],
                );
                result.container_name = name.to_string();
                Ok(result)
            }
        }
    }

    async fn container_status(
        &self,
        _agent_url: &str,
        container_id: &str,
    ) -> Result<ContainerStatus, AgentError> {
        Ok(ContainerStatus {
            container_id: container_id.to_string(),
            status: "running".to_string(),
            running: true,
            exit_code: None,
        })
    }

    async fn stop_container(&self, _agent_url: &str, _container_id: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn remove_container(
        &self,
        _agent_url: &str,
        _container_id: &str,
        _force: bool,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn restart_container(
        &self,
        _agent_url: &str,
        container_id: &str,
    ) -> Result<(), AgentError> {
        self.restarts.lock().await.push(container_id.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _agent_url: &str,
        _container_id: &str,
        _command: &str,
    ) -> Result<ExecResult, AgentError> {
        let exit_code = *self.exec_exit_code.lock().await;
        Ok(ExecResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

// ----------------------------------------------------------------------
// In-memory node store
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryNodeStore {
    inner: Mutex<HashMap<Uuid, InfrastructureNode>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn create(&self, node: &InfrastructureNode) -> EngineResult<()> {
        let mut store = self.inner.lock().await;
        if store.values().any(|n| n.node_name == node.node_name) {
            return Err(EngineError::AlreadyExists(format!("node {}", node.node_name)));
        }
        store.insert(node.node_id, node.clone());
        Ok(())
    }

    async fn get(&self, node_id: Uuid) -> EngineResult<Option<InfrastructureNode>> {
        Ok(self.inner.lock().await.get(&node_id).cloned())
    }

    async fn get_by_name(&self, node_name: &str) -> EngineResult<Option<InfrastructureNode>> {
        Ok(self
            .inner
            .lock()
            .await
            .values()
            .find(|n| n.node_name == node_name)
            .cloned())
    }

    async fn list_available(
        &self,
        runtime: Option<&str>,
    ) -> EngineResult<Vec<InfrastructureNode>> {
        let store = self.inner.lock().await;
        let mut nodes: Vec<InfrastructureNode> = store
            .values()
            .filter(|n| {
                n.status == NodeStatus::Ready
                    && matches!(n.health_status, NodeHealth::Healthy | NodeHealth::Unknown)
                    && runtime.map_or(true, |r| n.supported_runtimes.iter().any(|s| s == r))
            })
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.active_containers);
        Ok(nodes)
    }

    async fn list_all(&self) -> EngineResult<Vec<InfrastructureNode>> {
        let store = self.inner.lock().await;
        let mut nodes: Vec<InfrastructureNode> = store.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        Ok(nodes)
    }

    async fn update(&self, node: &InfrastructureNode) -> EngineResult<()> {
        let mut store = self.inner.lock().await;
        if !store.contains_key(&node.node_id) {
            return Err(EngineError::NotFound(format!("node {}", node.node_id)));
        }
        store.insert(node.node_id, node.clone());
        Ok(())
    }
}

// ----------------------------------------------------------------------
// In-memory domain store
// ----------------------------------------------------------------------

#[derive(Default)]
struct DomainState {
    templates: HashMap<(String, String), ApplicationTemplate>,
    applications: HashMap<Uuid, Application>,
    deployments: HashMap<Uuid, Deployment>,
    resources: HashMap<Uuid, DeployedResource>,
}

#[derive(Default)]
pub struct InMemoryDomainStore {
    inner: Mutex<DomainState>,
}

impl InMemoryDomainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DomainStore for InMemoryDomainStore {
    async fn create_template(&self, template: &ApplicationTemplate) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        let key = (template.template_id.clone(), template.version.clone());
        if state.templates.contains_key(&key) {
            return Err(EngineError::AlreadyExists(format!(
                "template {} version {}",
                template.template_id, template.version
            )));
        }
        state.templates.insert(key, template.clone());
        Ok(())
    }

    async fn get_template(
        &self,
        template_id: &str,
        version: &str,
    ) -> EngineResult<Option<ApplicationTemplate>> {
        let state = self.inner.lock().await;
        Ok(state
            .templates
            .get(&(template_id.to_string(), version.to_string()))
            .cloned())
    }

    async fn get_latest_template(
        &self,
        template_id: &str,
    ) -> EngineResult<Option<ApplicationTemplate>> {
        let state = self.inner.lock().await;
        Ok(state
            .templates
            .values()
            .filter(|t| t.template_id == template_id && t.active)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn create_application(&self, application: &Application) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if state.applications.contains_key(&application.application_id) {
            return Err(EngineError::AlreadyExists(format!(
                "application {}",
                application.application_id
            )));
        }
        state
            .applications
            .insert(application.application_id, application.clone());
        Ok(())
    }

    async fn get_application(&self, application_id: Uuid) -> EngineResult<Option<Application>> {
        Ok(self
            .inner
            .lock()
            .await
            .applications
            .get(&application_id)
            .cloned())
    }

    async fn update_application(&self, application: &Application) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if !state.applications.contains_key(&application.application_id) {
            return Err(EngineError::NotFound(format!(
                "application {}",
                application.application_id
            )));
        }
        state
            .applications
            .insert(application.application_id, application.clone());
        Ok(())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if state.deployments.contains_key(&deployment.deployment_id) {
            return Err(EngineError::AlreadyExists(format!(
                "deployment {}",
                deployment.deployment_id
            )));
        }
        state
            .deployments
            .insert(deployment.deployment_id, deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, deployment_id: Uuid) -> EngineResult<Option<Deployment>> {
        Ok(self
            .inner
            .lock()
            .await
            .deployments
            .get(&deployment_id)
            .cloned())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if !state.deployments.contains_key(&deployment.deployment_id) {
            return Err(EngineError::NotFound(format!(
                "deployment {}",
                deployment.deployment_id
            )));
        }
        state
            .deployments
            .insert(deployment.deployment_id, deployment.clone());
        Ok(())
    }

    async fn list_deploying_deployments(&self) -> EngineResult<Vec<Uuid>> {
        let state = self.inner.lock().await;
        let mut deploying: Vec<&Deployment> = state
            .deployments
            .values()
            .filter(|d| d.status == DeploymentStatus::Deploying)
            .collect();
        deploying.sort_by_key(|d| d.created_at);
        Ok(deploying.iter().map(|d| d.deployment_id).collect())
    }

    async fn create_resource(&self, resource: &DeployedResource) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if state.resources.contains_key(&resource.resource_id) {
            return Err(EngineError::AlreadyExists(format!(
                "resource {}",
                resource.resource_id
            )));
        }
        state.resources.insert(resource.resource_id, resource.clone());
        Ok(())
    }

    async fn get_resource(&self, resource_id: Uuid) -> EngineResult<Option<DeployedResource>> {
        Ok(self.inner.lock().await.resources.get(&resource_id).cloned())
    }

    async fn find_resource_by_execution(
        &self,
        execution_id: Uuid,
    ) -> EngineResult<Option<DeployedResource>> {
        let state = self.inner.lock().await;
        Ok(state
            .resources
            .values()
            .find(|r| r.execution_id() == Some(execution_id))
            .cloned())
    }

    async fn list_health_checkable(&self) -> EngineResult<Vec<DeployedResource>> {
        let state = self.inner.lock().await;
        let mut resources: Vec<DeployedResource> = state
            .resources
            .values()
            .filter(|r| {
                r.resource_type == ResourceType::Container
                    && r.status == "running"
                    && r.external_id != "pending"
            })
            .cloned()
            .collect();
        // NULLS FIRST ordering: never-checked resources come before stale ones.
        resources.sort_by_key(|r| (r.last_health_check_at.is_some(), r.last_health_check_at));
        Ok(resources)
    }

    async fn attach_deploy_result(
        &self,
        resource_id: Uuid,
        external_id: &str,
        status: &str,
        deployment_result: &serde_json::Value,
    ) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        let resource = state
            .resources
            .get_mut(&resource_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", resource_id)))?;
        resource.external_id = external_id.to_string();
        resource.status = status.to_string();
        resource.spec["deployment_result"] = deployment_result.clone();
        Ok(())
    }

    async fn record_health_check(
        &self,
        resource_id: Uuid,
        health: HealthStatus,
        consecutive_failures: i32,
        checked_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        let resource = state
            .resources
            .get_mut(&resource_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", resource_id)))?;
        resource.health_status = health;
        resource.consecutive_health_failures = consecutive_failures;
        resource.last_health_check_at = Some(checked_at);
        Ok(())
    }

    async fn reset_after_restart(&self, resource_id: Uuid) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        let resource = state
            .resources
            .get_mut(&resource_id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", resource_id)))?;
        resource.health_status = HealthStatus::Starting;
        resource.consecutive_health_failures = 0;
        Ok(())
    }
}
