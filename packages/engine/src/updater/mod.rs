//! Status updater: reconciles deployment and application status from
//! execution ground truth.
//!
//! Deployment status is a materialised view over the child execution rows.
//! The orchestrator returns as soon as executions are queued; this loop is
//! what eventually moves the deployment (and its application) to RUNNING
//! or FAILED. Re-running a cycle over stable rows changes nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::common::EngineResult;
use crate::domain::{ApplicationStatus, DeploymentStatus, DomainStore};
use crate::executions::{Execution, ExecutionState, ExecutionStore};

pub struct StatusUpdater {
    executions: Arc<dyn ExecutionStore>,
    domain: Arc<dyn DomainStore>,
    poll_interval: Duration,
}

impl StatusUpdater {
    pub fn new(executions: Arc<dyn ExecutionStore>, domain: Arc<dyn DomainStore>) -> Self {
        Self {
            executions,
            domain,
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "status updater starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "error in status update cycle");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("status updater stopped");
        Ok(())
    }

    /// One reconciliation pass over every DEPLOYING deployment.
    pub async fn run_cycle(&self) -> EngineResult<()> {
        let deploying = self.domain.list_deploying_deployments().await?;
        if deploying.is_empty() {
            debug!("no active deployments to check");
            return Ok(());
        }

        for deployment_id in deploying {
            if let Err(e) = self.update_deployment(deployment_id).await {
                error!(deployment_id = %deployment_id, error = %e, "failed to update deployment");
            }
        }
        Ok(())
    }

    async fn update_deployment(&self, deployment_id: Uuid) -> EngineResult<()> {
        let Some(mut deployment) = self.domain.get_deployment(deployment_id).await? else {
            return Ok(());
        };

        let executions = self.executions.list_by_deployment(deployment_id).await?;
        if executions.is_empty() {
            debug!(deployment_id = %deployment_id, "no executions yet");
            return Ok(());
        }

        let total = executions.len();
        let completed = executions
            .iter()
            .filter(|e| e.state == ExecutionState::Completed)
            .count();
        let terminally_failed: Vec<&Execution> = executions
            .iter()
            .filter(|e| is_terminal_failure(e))
            .collect();

        debug!(
            deployment_id = %deployment_id,
            completed,
            failed = terminally_failed.len(),
            total,
            "deployment rollup"
        );

        let new_status = if !terminally_failed.is_empty() {
            DeploymentStatus::Failed
        } else if completed == total {
            DeploymentStatus::Running
        } else {
            return Ok(());
        };

        if new_status == deployment.status {
            return Ok(());
        }

        info!(
            deployment_id = %deployment_id,
            from = ?deployment.status,
            to = ?new_status,
            "updating deployment status"
        );

        deployment.status = new_status;
        deployment.completed_at = Some(Utc::now());
        if new_status == DeploymentStatus::Failed {
            let errors: Vec<&str> = executions
                .iter()
                .filter_map(|e| e.error_message.as_deref())
                .collect();
            deployment.error_message = if errors.is_empty() {
                Some("Deployment failed".to_string())
            } else {
                Some(errors.join("; "))
            };
        }
        self.domain.update_deployment(&deployment).await?;

        self.update_application(deployment.application_id, new_status)
            .await
    }

    async fn update_application(
        &self,
        application_id: Uuid,
        deployment_status: DeploymentStatus,
    ) -> EngineResult<()> {
        let new_status = match deployment_status {
            DeploymentStatus::Running => ApplicationStatus::Running,
            DeploymentStatus::Failed => ApplicationStatus::Failed,
            _ => return Ok(()),
        };

        let Some(mut application) = self.domain.get_application(application_id).await? else {
            debug!(application_id = %application_id, "application not found for rollup");
            return Ok(());
        };

        if application.status == new_status {
            return Ok(());
        }

        info!(
            application_id = %application_id,
            from = ?application.status,
            to = ?new_status,
            "updating application status"
        );
        application.status = new_status;
        self.domain.update_application(&application).await
    }
}

/// A FAILED execution only fails its deployment once retries cannot save
/// it: the retry budget is exhausted, or the error is permanent. Anything
/// else still belongs to the retry scheduler.
fn is_terminal_failure(execution: &Execution) -> bool {
    execution.state == ExecutionState::Failed
        && (execution.retry_count >= execution.max_retries || !execution.is_transient_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn failed_execution(error: &str, retry_count: i32) -> Execution {
        let mut execution = Execution::builder()
            .tenant_id(Uuid::new_v4())
            .application_id(Uuid::new_v4())
            .build();
        execution.state = ExecutionState::Failed;
        execution.error_message = Some(error.to_string());
        execution.retry_count = retry_count;
        execution
    }

    #[test]
    fn transient_failure_with_budget_left_is_not_terminal() {
        let execution = failed_execution("connection refused", 1);
        assert!(!is_terminal_failure(&execution));
    }

    #[test]
    fn exhausted_retries_make_a_failure_terminal() {
        let execution = failed_execution("connection refused", 3);
        assert!(is_terminal_failure(&execution));
    }

    #[test]
    fn permanent_errors_are_terminal_immediately() {
        let execution = failed_execution("status 404 - image not found", 0);
        assert!(is_terminal_failure(&execution));
    }
}
