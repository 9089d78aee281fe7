//! Deployment orchestrator: expands a deployment's resolved template into
//! queued executions plus placeholder resource rows, then returns.
//!
//! The orchestrator runs inside a request handler, so it never waits for
//! executions - the status updater closes the loop. Only a failure of
//! orchestration itself (missing config, no node with capacity) marks the
//! deployment FAILED here.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};
use crate::domain::{
    DeployedResource, Deployment, DeploymentStatus, DeploymentStep, DomainStore, HealthStatus,
};
use crate::executions::{Execution, ExecutionStore};
use crate::nodes::NodeRegistry;

const NO_NODE_AVAILABLE: &str = "No suitable infrastructure node available";

pub struct DeploymentOrchestrator {
    domain: Arc<dyn DomainStore>,
    executions: Arc<dyn ExecutionStore>,
    nodes: NodeRegistry,
}

impl DeploymentOrchestrator {
    pub fn new(
        domain: Arc<dyn DomainStore>,
        executions: Arc<dyn ExecutionStore>,
        nodes: NodeRegistry,
    ) -> Self {
        Self {
            domain,
            executions,
            nodes,
        }
    }

    /// Start a deployment: mark it DEPLOYING, create one queued execution
    /// per container step, and return immediately.
    pub async fn start_deployment(&self, deployment_id: Uuid) -> EngineResult<()> {
        let mut deployment = self
            .domain
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", deployment_id)))?;

        let template = self
            .domain
            .get_template(&deployment.template_id, &deployment.template_version)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "template {} version {} not found",
                    deployment.template_id, deployment.template_version
                ))
            })?;

        deployment.status = DeploymentStatus::Deploying;
        deployment.started_at = Some(Utc::now());
        self.domain.update_deployment(&deployment).await?;

        let mut steps = template.deployment_steps.clone();
        steps.sort_by_key(|step| step.order);
        info!(
            deployment_id = %deployment_id,
            steps = steps.len(),
            "starting deployment"
        );

        for step in &steps {
            if let Err(e) = self.execute_step(&deployment, step).await {
                error!(
                    deployment_id = %deployment_id,
                    step_id = %step.step_id,
                    error = %e,
                    "orchestration failed"
                );
                deployment.status = DeploymentStatus::Failed;
                deployment.error_message = Some(format!("Orchestration error: {}", e));
                deployment.completed_at = Some(Utc::now());
                self.domain.update_deployment(&deployment).await?;
                return Err(e);
            }
        }

        info!(
            deployment_id = %deployment_id,
            "all executions queued, status updater will monitor"
        );
        Ok(())
    }

    async fn execute_step(
        &self,
        deployment: &Deployment,
        step: &DeploymentStep,
    ) -> EngineResult<serde_json::Value> {
        let step_config = find_step_config(&deployment.resolved_config, &step.step_id)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "step {} not found in resolved config",
                    step.step_id
                ))
            })?;

        match step.step_type.as_str() {
            "volume" => self.execute_volume_step(&step_config),
            "database" => self.execute_database_step(&step_config),
            "container" => self.execute_container_step(deployment, step, &step_config).await,
            other => Err(EngineError::Validation(format!(
                "unknown step type: {}",
                other
            ))),
        }
    }

    /// Volume provisioning is not wired to a backend yet; the dispatcher
    /// slot is reserved and the step reports synthetic success.
    fn execute_volume_step(&self, step_config: &serde_json::Value) -> EngineResult<serde_json::Value> {
        let volume_name = step_config["spec_template"]["volume_name"].clone();
        info!(volume_name = %volume_name, "volume step acknowledged");
        Ok(json!({
            "volume_name": volume_name,
            "status": "created",
        }))
    }

    /// Database provisioning is not wired to a backend yet; the dispatcher
    /// slot is reserved and the step reports synthetic connection details.
    fn execute_database_step(
        &self,
        step_config: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        let spec = &step_config["spec_template"];
        info!(db_name = %spec["db_name"], "database step acknowledged");
        Ok(json!({
            "db_type": spec["db_type"],
            "db_name": spec["db_name"],
            "db_user": spec["db_user"],
            "db_host": "mysql-server.local",
            "db_port": 3306,
            "status": "ready",
        }))
    }

    async fn execute_container_step(
        &self,
        deployment: &Deployment,
        step: &DeploymentStep,
        step_config: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        let spec = step_config
            .get("spec_template")
            .ok_or_else(|| {
                EngineError::Validation(format!("step {} has no spec_template", step.step_id))
            })?
            .clone();

        let resources = spec.get("resources").cloned().unwrap_or(json!({}));
        let required_cpu = parse_cpu(resources.get("cpu"))?;
        let required_memory = parse_memory(
            resources
                .get("memory")
                .and_then(|m| m.as_str())
                .unwrap_or("512Mi"),
        )?;

        let node = self
            .nodes
            .select("docker", required_cpu, required_memory, 1)
            .await?
            .ok_or_else(|| EngineError::Validation(NO_NODE_AVAILABLE.to_string()))?;

        // The execution carries everything the slot body needs: the node,
        // its agent endpoint, and the container spec.
        let mut execution = Execution::builder()
            .tenant_id(deployment.tenant_id)
            .application_id(deployment.application_id)
            .deployment_id(deployment.deployment_id)
            .spec(json!({
                "node_id": node.node_id.to_string(),
                "agent_url": node.runtime_agent_url,
                "container_spec": spec,
            }))
            .build();

        self.executions.create(&execution).await?;
        execution.queue()?;
        self.executions.update(&execution).await?;

        info!(
            execution_id = %execution.execution_id,
            node_name = %node.node_name,
            "queued container execution"
        );

        // Placeholder resource row. The health monitor finds the probe
        // definition and the owning execution through the spec.
        let container_name = spec
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or(&step.step_id)
            .to_string();

        let mut resource_spec = step_config.clone();
        resource_spec["execution_id"] = json!(execution.execution_id.to_string());
        resource_spec["health_check"] = match &step.health_check {
            Some(check) => serde_json::to_value(check)
                .map_err(|e| EngineError::Validation(format!("invalid health check: {}", e)))?,
            None => serde_json::Value::Null,
        };

        let resource = DeployedResource::builder()
            .deployment_id(deployment.deployment_id)
            .node_id(node.node_id)
            .name(container_name.clone())
            .spec(resource_spec)
            .health_status(HealthStatus::Unknown)
            .build();

        self.domain.create_resource(&resource).await?;

        info!(
            resource_id = %resource.resource_id,
            execution_id = %execution.execution_id,
            "tracked deployed resource"
        );

        Ok(json!({
            "execution_id": execution.execution_id.to_string(),
            "resource_id": resource.resource_id.to_string(),
            "node_id": node.node_id.to_string(),
            "node_name": node.node_name,
            "container_name": container_name,
            "status": "queued",
        }))
    }
}

fn find_step_config(resolved_config: &serde_json::Value, step_id: &str) -> Option<serde_json::Value> {
    resolved_config
        .get("steps")?
        .as_array()?
        .iter()
        .find(|step| step.get("step_id").and_then(|id| id.as_str()) == Some(step_id))
        .cloned()
}

fn parse_cpu(value: Option<&serde_json::Value>) -> EngineResult<f64> {
    match value {
        None => Ok(0.5),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64().unwrap_or(0.5)),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid cpu request: {}", s))),
        Some(other) => Err(EngineError::Validation(format!(
            "invalid cpu request: {}",
            other
        ))),
    }
}

/// Parse a memory request (`512Mi`, `1Gi`, `256M`, `2G`, or plain MB) to MB.
fn parse_memory(memory: &str) -> EngineResult<i64> {
    let memory = memory.trim();
    let parse = |digits: &str| -> EngineResult<f64> {
        digits
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid memory request: {}", memory)))
    };

    if let Some(digits) = memory.strip_suffix("Gi") {
        Ok((parse(digits)? * 1024.0) as i64)
    } else if let Some(digits) = memory.strip_suffix("Mi") {
        Ok(parse(digits)? as i64)
    } else if let Some(digits) = memory.strip_suffix('G') {
        Ok((parse(digits)? * 1024.0) as i64)
    } else if let Some(digits) = memory.strip_suffix('M') {
        Ok(parse(digits)? as i64)
    } else {
        Ok(parse(memory)? as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_suffixes_convert_to_mb() {
        assert_eq!(parse_memory("512Mi").unwrap(), 512);
        assert_eq!(parse_memory("1Gi").unwrap(), 1024);
        assert_eq!(parse_memory("1.5Gi").unwrap(), 1536);
        assert_eq!(parse_memory("256M").unwrap(), 256);
        assert_eq!(parse_memory("2G").unwrap(), 2048);
        assert_eq!(parse_memory("768").unwrap(), 768);
    }

    #[test]
    fn garbage_memory_requests_are_rejected() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("Gi").is_err());
    }

    #[test]
    fn cpu_accepts_numbers_and_strings() {
        assert_eq!(parse_cpu(Some(&json!(2.0))).unwrap(), 2.0);
        assert_eq!(parse_cpu(Some(&json!("0.25"))).unwrap(), 0.25);
        assert_eq!(parse_cpu(None).unwrap(), 0.5);
        assert!(parse_cpu(Some(&json!("two"))).is_err());
    }

    #[test]
    fn step_config_lookup_matches_on_step_id() {
        let config = json!({"steps": [
            {"step_id": "a", "spec_template": {}},
            {"step_id": "b", "spec_template": {}},
        ]});
        assert!(find_step_config(&config, "b").is_some());
        assert!(find_step_config(&config, "missing").is_none());
    }
}
