//! Orchestrator: step expansion, node selection, and the no-capacity path.

mod common;

use common::{create_deployment, register_node, single_step_template, Harness};
use engine_core::domain::{
    DeploymentStatus, DeploymentStep, DomainStore, HealthCheckSpec, HealthStatus,
};
use engine_core::executions::{ExecutionState, ExecutionStore};
use serde_json::json;

#[tokio::test]
async fn container_step_becomes_a_queued_execution_and_pending_resource() {
    let harness = Harness::new();
    let node = register_node(&harness, "node-1").await;

    let (_, deployment) = create_deployment(
        &harness,
        single_step_template(Some(HealthCheckSpec {
            check_type: "http".into(),
            path: Some("/".into()),
            port: Some(80),
            command: None,
            interval_seconds: 10,
            timeout_seconds: 5,
            retries: 3,
            initial_delay_seconds: 0,
        })),
    )
    .await;

    harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await
        .unwrap();

    let deployment = harness
        .kernel
        .domain
        .get_deployment(deployment.deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Deploying);
    assert!(deployment.started_at.is_some());

    let executions = harness
        .kernel
        .executions
        .list_by_deployment(deployment.deployment_id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.state, ExecutionState::Queued);
    assert_eq!(execution.execution_type, "deploy");
    assert_eq!(
        execution.spec["agent_url"],
        json!(node.runtime_agent_url)
    );
    // Template variables resolved into the container spec.
    assert_eq!(execution.spec["container_spec"]["name"], json!("web-blog"));

    let resource = harness
        .kernel
        .domain
        .find_resource_by_execution(execution.execution_id)
        .await
        .unwrap()
        .expect("resource row created before completion");
    assert_eq!(resource.external_id, "pending");
    assert_eq!(resource.health_status, HealthStatus::Unknown);
    assert_eq!(resource.node_id, node.node_id);
    let probe = resource.health_check().expect("probe definition kept");
    assert_eq!(probe.check_type, "http");
    assert_eq!(probe.port, Some(80));
}

#[tokio::test]
async fn no_capacity_fails_the_deployment_without_executions() {
    let harness = Harness::new();
    // No nodes registered at all.
    let (_, deployment) = create_deployment(&harness, single_step_template(None)).await;

    let result = harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await;
    assert!(result.is_err());

    let deployment = harness
        .kernel
        .domain
        .get_deployment(deployment.deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment
        .error_message
        .as_ref()
        .unwrap()
        .contains("No suitable infrastructure node available"));
    assert!(deployment.completed_at.is_some());

    let executions = harness
        .kernel
        .executions
        .list_by_deployment(deployment.deployment_id)
        .await
        .unwrap();
    assert!(executions.is_empty());
}

#[tokio::test]
async fn volume_and_database_steps_do_not_create_executions() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;

    let template = engine_core::domain::ApplicationTemplate::builder()
        .template_id("nginx")
        .version("1.0.0")
        .name("Stack")
        .deployment_steps(vec![
            DeploymentStep {
                step_id: "data".into(),
                step_name: "Data volume".into(),
                step_type: "volume".into(),
                order: 1,
                depends_on: vec![],
                spec_template: json!({"volume_name": "data-{{site_name}}"}),
                health_check: None,
            },
            DeploymentStep {
                step_id: "db".into(),
                step_name: "Database".into(),
                step_type: "database".into(),
                order: 2,
                depends_on: vec![],
                spec_template: json!({"db_type": "mysql", "db_name": "app", "db_user": "app"}),
                health_check: None,
            },
            DeploymentStep {
                step_id: "web".into(),
                step_name: "Web".into(),
                step_type: "container".into(),
                order: 3,
                depends_on: vec!["db".into()],
                spec_template: json!({
                    "image": "nginx:alpine",
                    "name": "web-{{site_name}}",
                    "resources": {"cpu": "0.5", "memory": "512Mi"},
                }),
                health_check: None,
            },
        ])
        .build();

    let (_, deployment) = create_deployment(&harness, template).await;
    harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await
        .unwrap();

    // Only the container step queues work.
    let executions = harness
        .kernel
        .executions
        .list_by_deployment(deployment.deployment_id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
}

#[tokio::test]
async fn steps_requesting_more_than_any_node_has_fail_orchestration() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;

    let template = engine_core::domain::ApplicationTemplate::builder()
        .template_id("nginx")
        .version("1.0.0")
        .name("Huge")
        .deployment_steps(vec![DeploymentStep {
            step_id: "web".into(),
            step_name: "Web".into(),
            step_type: "container".into(),
            order: 1,
            depends_on: vec![],
            spec_template: json!({
                "image": "nginx:alpine",
                "name": "web",
                "resources": {"cpu": "64", "memory": "1024Gi"},
            }),
            health_check: None,
        }])
        .build();

    let (_, deployment) = create_deployment(&harness, template).await;
    let result = harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await;
    assert!(result.is_err());

    let deployment = harness
        .kernel
        .domain
        .get_deployment(deployment.deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
}
