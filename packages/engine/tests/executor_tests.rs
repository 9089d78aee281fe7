//! Executor integration tests over the in-memory kernel: the happy path,
//! claim contention, crash recovery, and transient failure.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{create_deployment, queued_execution, register_node, single_step_template, Harness};
use engine_core::domain::{ApplicationStatus, DeploymentStatus, DomainStore};
use engine_core::executions::{ExecutionState, ExecutionStore};
use engine_core::executor::{Executor, ExecutorConfig};
use engine_core::testing::StubRuntime;
use engine_core::updater::StatusUpdater;

fn executor(harness: &Harness, worker_id: &str, lease_seconds: i64) -> Executor {
    Executor::new(
        Arc::clone(&harness.kernel.executions),
        Arc::clone(&harness.kernel.domain),
        Arc::clone(&harness.kernel.runtime),
        ExecutorConfig {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_millis(50),
            max_slots: 2,
            lease_seconds,
        },
    )
}

#[tokio::test]
async fn happy_path_deploys_a_single_step_application() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;
    harness
        .runtime
        .push_deploy_result(StubRuntime::success_result("c-abc", &[(80, 8080)]))
        .await;

    let (application, deployment) = create_deployment(&harness, single_step_template(None)).await;

    harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await
        .unwrap();

    let execution = queued_execution(&harness.kernel.executions, deployment.deployment_id).await;
    assert_eq!(execution.state, ExecutionState::Queued);

    let worker = executor(&harness, "worker-1", 30);
    worker.tick().await;

    let completed = common::wait_for_state(
        &harness.kernel.executions,
        execution.execution_id,
        ExecutionState::Completed,
    )
    .await;
    assert!(completed.lease_owner.is_none());
    assert!(completed.finished_at.is_some());
    assert_eq!(
        completed.deployment_result.as_ref().unwrap()["container_id"],
        serde_json::json!("c-abc")
    );

    // Resource row got the agent-assigned id exactly once.
    let resource = harness
        .kernel
        .domain
        .find_resource_by_execution(execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resource.external_id, "c-abc");
    assert_eq!(resource.status, "running");
    assert_eq!(resource.host_port(80), Some(8080));

    // The status updater closes the loop to RUNNING.
    let updater = StatusUpdater::new(
        Arc::clone(&harness.kernel.executions),
        Arc::clone(&harness.kernel.domain),
    );
    updater.run_cycle().await.unwrap();

    let deployment = harness
        .kernel
        .domain
        .get_deployment(deployment.deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert!(deployment.completed_at.is_some());

    let application = harness
        .kernel
        .domain
        .get_application(application.application_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(application.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn contending_executors_claim_exactly_once() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;

    let (_, deployment) = create_deployment(&harness, single_step_template(None)).await;
    harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await
        .unwrap();
    let execution = queued_execution(&harness.kernel.executions, deployment.deployment_id).await;

    let first = executor(&harness, "worker-1", 30);
    let second = executor(&harness, "worker-2", 30);

    // Both poll within the same instant; exactly one claim wins and the
    // loser proceeds without error.
    tokio::join!(first.tick(), second.tick());

    common::wait_for_state(
        &harness.kernel.executions,
        execution.execution_id,
        ExecutionState::Completed,
    )
    .await;

    assert_eq!(harness.runtime.deploys().await.len(), 1);
}

#[tokio::test]
async fn second_executor_recovers_a_crashed_workers_execution() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;
    harness
        .runtime
        .push_deploy_result(StubRuntime::success_result("c-abc", &[(80, 8080)]))
        .await;

    let (_, deployment) = create_deployment(&harness, single_step_template(None)).await;
    harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await
        .unwrap();
    let execution = queued_execution(&harness.kernel.executions, deployment.deployment_id).await;

    // A worker claims and starts, then dies without heartbeating.
    let store = &harness.kernel.executions;
    assert!(store
        .try_claim(execution.execution_id, "crashed-worker", 1)
        .await
        .unwrap());
    store
        .start(execution.execution_id, "crashed-worker")
        .await
        .unwrap();

    // Wait out the lease.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let survivor = executor(&harness, "worker-2", 30);
    survivor.tick().await;

    let completed = common::wait_for_state(
        &harness.kernel.executions,
        execution.execution_id,
        ExecutionState::Completed,
    )
    .await;
    assert!(completed.lease_owner.is_none());

    // The deploy ran exactly once under the surviving worker, and the
    // resource id was written exactly once to a non-pending value.
    assert_eq!(harness.runtime.deploys().await.len(), 1);
    let resource = harness
        .kernel
        .domain
        .find_resource_by_execution(execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resource.external_id, "c-abc");
}

#[tokio::test]
async fn unreachable_agent_finalizes_failed_with_transient_error() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;
    harness
        .runtime
        .push_deploy_failure("cannot connect to runtime agent at http://node-1:9000: connection refused or unreachable")
        .await;

    let (_, deployment) = create_deployment(&harness, single_step_template(None)).await;
    harness
        .kernel
        .orchestrator()
        .start_deployment(deployment.deployment_id)
        .await
        .unwrap();
    let execution = queued_execution(&harness.kernel.executions, deployment.deployment_id).await;

    let worker = executor(&harness, "worker-1", 30);
    worker.tick().await;

    let failed = common::wait_for_state(
        &harness.kernel.executions,
        execution.execution_id,
        ExecutionState::Failed,
    )
    .await;
    assert!(failed.error_message.as_ref().unwrap().contains("connection refused"));
    assert!(failed.is_transient_error());
    assert!(failed.can_retry());
    assert!(failed.lease_owner.is_none());
}

#[tokio::test]
async fn busy_executor_leaves_work_queued() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;

    // Three executions but only two slots.
    let service = harness.kernel.domain_service();
    service
        .register_template(single_step_template(None))
        .await
        .unwrap();
    let mut execution_ids = Vec::new();
    for i in 0..3 {
        let application = service
            .create_application(
                uuid::Uuid::new_v4(),
                "nginx",
                &format!("app-{}", i),
                serde_json::json!({"site_name": format!("site{}", i)}),
                None,
            )
            .await
            .unwrap();
        let deployment = service
            .create_deployment(application.application_id)
            .await
            .unwrap();
        harness
            .kernel
            .orchestrator()
            .start_deployment(deployment.deployment_id)
            .await
            .unwrap();
        let execution =
            queued_execution(&harness.kernel.executions, deployment.deployment_id).await;
        execution_ids.push(execution.execution_id);
    }

    let worker = executor(&harness, "worker-1", 30);
    // One dispatch per tick, bounded by the two slots.
    worker.tick().await;
    worker.tick().await;

    for execution_id in &execution_ids[..2] {
        common::wait_for_state(
            &harness.kernel.executions,
            *execution_id,
            ExecutionState::Completed,
        )
        .await;
    }

    // Third only runs once a slot frees up on a later tick.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while worker.active_slots() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "slots never freed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.tick().await;
    common::wait_for_state(
        &harness.kernel.executions,
        execution_ids[2],
        ExecutionState::Completed,
    )
    .await;
}
