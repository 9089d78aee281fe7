//! Retry scheduler: feeds transient failures back into the queue with
//! exponential backoff.
//!
//! Only transient errors (connection failures, timeouts, 5xx, capacity
//! shortage) are retried, and only while the retry budget lasts - backoff
//! 10s, 30s, then 90s from the failure timestamp. Permanent errors stay
//! FAILED so malformed specs cannot loop forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::{EngineError, EngineResult};
use crate::executions::{Execution, ExecutionState, ExecutionStore};

pub struct RetryScheduler {
    executions: Arc<dyn ExecutionStore>,
    poll_interval: Duration,
    batch_size: i64,
}

impl RetryScheduler {
    pub fn new(executions: Arc<dyn ExecutionStore>) -> Self {
        Self {
            executions,
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "retry scheduler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(0) => {}
                Ok(retried) => info!(retried, "re-queued failed executions"),
                Err(e) => error!(error = %e, "error in retry cycle"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("retry scheduler stopped");
        Ok(())
    }

    /// One pass: find due retryable failures and re-queue them. Returns
    /// how many executions were re-queued. Running a cycle when nothing is
    /// due does nothing.
    pub async fn run_cycle(&self) -> EngineResult<usize> {
        let failed = self
            .executions
            .list_by_state(ExecutionState::Failed, self.batch_size * 2)
            .await?;

        let mut retried = 0;
        for execution in failed {
            if retried as i64 >= self.batch_size {
                break;
            }
            if !is_due_for_retry(&execution) {
                continue;
            }
            match self.requeue(execution).await {
                Ok(()) => retried += 1,
                // Someone else touched the row; it will come around again.
                Err(EngineError::Concurrency(_)) => {}
                Err(e) => error!(error = %e, "failed to re-queue execution"),
            }
        }

        Ok(retried)
    }

    /// Reset to CREATED (clearing lease and failure fields, bumping the
    /// retry count), then re-enter the queue through the normal transition.
    async fn requeue(&self, mut execution: Execution) -> EngineResult<()> {
        let execution_id = execution.execution_id;
        let attempt = execution.retry_count + 1;

        execution.reset_for_retry()?;
        self.executions.update(&execution).await?;

        execution.queue()?;
        self.executions.update(&execution).await?;

        info!(
            execution_id = %execution_id,
            attempt,
            max_retries = execution.max_retries,
            "re-queued execution for retry"
        );
        Ok(())
    }
}

fn is_due_for_retry(execution: &Execution) -> bool {
    if !execution.can_retry() {
        return false;
    }
    if !execution.is_transient_error() {
        debug!(
            execution_id = %execution.execution_id,
            "permanent error, not retrying"
        );
        return false;
    }
    match execution.finished_at {
        Some(finished_at) => {
            let due_at = finished_at + chrono::Duration::seconds(execution.retry_delay());
            Utc::now() >= due_at
        }
        None => true,
    }
}
