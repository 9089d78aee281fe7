//! Shared fixtures for the integration suites: an in-memory kernel with a
//! scripted runtime gateway, plus template/node helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use engine_core::domain::{
    Application, ApplicationTemplate, Deployment, DeploymentStep, HealthCheckSpec,
};
use engine_core::executions::{Execution, ExecutionState, ExecutionStore};
use engine_core::nodes::InfrastructureNode;
use engine_core::testing::{in_memory_kernel, StubRuntime};
use engine_core::EngineKernel;
use serde_json::json;
use uuid::Uuid;

pub struct Harness {
    pub kernel: EngineKernel,
    pub runtime: Arc<StubRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        let runtime = Arc::new(StubRuntime::new());
        let kernel = in_memory_kernel(runtime.clone());
        Self { kernel, runtime }
    }
}

/// Register a node with plenty of room: 8 cores, 16 GiB, 500 GB.
pub async fn register_node(harness: &Harness, name: &str) -> InfrastructureNode {
    let node = InfrastructureNode::builder()
        .node_name(name)
        .internal_ip("10.0.1.10")
        .runtime_agent_url(format!("http://{}:9000", name))
        .total_cpu(8.0)
        .total_memory(16_384_i64)
        .total_storage(500_i64)
        .available_cpu(8.0)
        .available_memory(16_384_i64)
        .available_storage(500_i64)
        .build();
    harness
        .kernel
        .node_registry()
        .register(node)
        .await
        .expect("node registers")
}

/// Single container-step template requesting 0.5 CPU / 512 MiB.
pub fn single_step_template(health_check: Option<HealthCheckSpec>) -> ApplicationTemplate {
    ApplicationTemplate::builder()
        .template_id("nginx")
        .version("1.0.0")
        .name("Nginx")
        .deployment_steps(vec![DeploymentStep {
            step_id: "web".into(),
            step_name: "Web server".into(),
            step_type: "container".into(),
            order: 1,
            depends_on: vec![],
            spec_template: json!({
                "image": "nginx:alpine",
                "name": "web-{{site_name}}",
                "ports": {"80/tcp": 8080},
                "resources": {"cpu": "0.5", "memory": "512Mi"},
            }),
            health_check,
        }])
        .build()
}

/// Register the template, create an application, and create a deployment.
pub async fn create_deployment(
    harness: &Harness,
    template: ApplicationTemplate,
) -> (Application, Deployment) {
    let service = harness.kernel.domain_service();
    service
        .register_template(template)
        .await
        .expect("template registers");

    let application = service
        .create_application(
            Uuid::new_v4(),
            "nginx",
            "my-blog",
            json!({"site_name": "blog"}),
            None,
        )
        .await
        .expect("application creates");

    let deployment = service
        .create_deployment(application.application_id)
        .await
        .expect("deployment creates");

    (application, deployment)
}

/// Poll until the execution reaches `state`, or panic after five seconds.
pub async fn wait_for_state(
    store: &Arc<dyn ExecutionStore>,
    execution_id: Uuid,
    state: ExecutionState,
) -> Execution {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let execution = store
            .get(execution_id)
            .await
            .expect("store reads")
            .expect("execution exists");
        if execution.state == state {
            return execution;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {:?}; execution is {:?} ({:?})",
            state,
            execution.state,
            execution.error_message
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The single queued execution belonging to `deployment_id`.
pub async fn queued_execution(
    store: &Arc<dyn ExecutionStore>,
    deployment_id: Uuid,
) -> Execution {
    let executions = store
        .list_by_deployment(deployment_id)
        .await
        .expect("store lists");
    assert_eq!(executions.len(), 1, "expected exactly one execution");
    executions.into_iter().next().unwrap()
}
