//! Retry scheduler: classified backoff requeue end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{create_deployment, queued_execution, register_node, single_step_template, Harness};
use engine_core::executions::{Execution, ExecutionState, ExecutionStore};
use engine_core::executor::{Executor, ExecutorConfig};
use engine_core::retry::RetryScheduler;
use uuid::Uuid;

fn scheduler(harness: &Harness) -> RetryScheduler {
    RetryScheduler::new(Arc::clone(&harness.kernel.executions))
}

/// Insert a FAILED execution whose failure finished `secs_ago` seconds ago.
async fn insert_failed(
    harness: &Harness,
    error: &str,
    secs_ago: i64,
    retry_count: i32,
) -> Execution {
    let mut execution = Execution::builder()
        .tenant_id(Uuid::new_v4())
        .application_id(Uuid::new_v4())
        .build();
    execution.state = ExecutionState::Failed;
    execution.error_message = Some(error.to_string());
    execution.finished_at = Some(Utc::now() - chrono::Duration::seconds(secs_ago));
    execution.retry_count = retry_count;
    harness.kernel.executions.create(&execution).await.unwrap();
    execution
}

#[tokio::test]
async fn due_transient_failure_is_reset_and_requeued() {
    let harness = Harness::new();
    let execution = insert_failed(&harness, "connection refused", 11, 0).await;

    let retried = scheduler(&harness).run_cycle().await.unwrap();
    assert_eq!(retried, 1);

    let requeued = harness
        .kernel
        .executions
        .get(execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.state, ExecutionState::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.error_message.is_none());
    assert!(requeued.finished_at.is_none());
    assert!(requeued.lease_owner.is_none());
    assert!(requeued.queued_at.is_some());
}

#[tokio::test]
async fn failure_inside_backoff_window_is_left_alone() {
    let harness = Harness::new();
    let execution = insert_failed(&harness, "connection refused", 3, 0).await;

    let retried = scheduler(&harness).run_cycle().await.unwrap();
    assert_eq!(retried, 0);

    let untouched = harness
        .kernel
        .executions
        .get(execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.state, ExecutionState::Failed);
    assert_eq!(untouched.retry_count, 0);
}

#[tokio::test]
async fn permanent_failures_are_never_requeued() {
    let harness = Harness::new();
    insert_failed(
        &harness,
        "runtime agent rejected request: status 404 - image not found",
        600,
        0,
    )
    .await;

    assert_eq!(scheduler(&harness).run_cycle().await.unwrap(), 0);
}

#[tokio::test]
async fn exhausted_retry_budget_stays_failed() {
    let harness = Harness::new();
    let execution = insert_failed(&harness, "connection refused", 600, 3).await;

    assert_eq!(scheduler(&harness).run_cycle().await.unwrap(), 0);

    let still_failed = harness
        .kernel
        .executions
        .get(execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_failed.state, ExecutionState::Failed);
    assert_eq!(still_failed.retry_count, 3);
}

#[tokio::test]
async fn idle_cycle_does_nothing() {
    let harness = Harness::new();
    assert_eq!(scheduler(&harness).run_cycle().await.unwrap(), 0);
}

#[tokio::test]
async fn retried_execution_runs_again_and_succeeds() {
    let harness = Harness::new();
    register_node(&harness, "node-1").await;
    // First attempt fails transiently, second (the retry) succeeds via the
    // stub's default result.
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

    let worker = Executor::new(
        Arc::clone(&harness.kernel.executions),
        Arc::clone(&harness.kernel.domain),
        Arc::clone(&harness.kernel.runtime),
        ExecutorConfig {
            worker_id: "worker-1".into(),
            poll_interval: Duration::from_millis(50),
            max_slots: 2,
            lease_seconds: 30,
        },
    );

    worker.tick().await;
    let failed = common::wait_for_state(
        &harness.kernel.executions,
        execution.execution_id,
        ExecutionState::Failed,
    )
    .await;
    assert!(failed.is_transient_error());

    // Backdate the failure so the 10s backoff has elapsed.
    let mut backdated = failed.clone();
    backdated.finished_at = Some(Utc::now() - chrono::Duration::seconds(11));
    backdated.version += 1;
    harness.kernel.executions.update(&backdated).await.unwrap();

    assert_eq!(scheduler(&harness).run_cycle().await.unwrap(), 1);

    worker.tick().await;
    let completed = common::wait_for_state(
        &harness.kernel.executions,
        execution.execution_id,
        ExecutionState::Completed,
    )
    .await;
    assert_eq!(completed.retry_count, 1);
    assert_eq!(harness.runtime.deploys().await.len(), 2);
}
