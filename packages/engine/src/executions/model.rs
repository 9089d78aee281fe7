//! Execution row model with guarded state transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};

/// Exponential backoff schedule for transient failures, in seconds.
pub const RETRY_BACKOFF_SECONDS: [i64; 3] = [10, 30, 90];

/// Error fragments that mark a failure as transient and therefore
/// eligible for backoff-retry. Permanent errors (4xx, validation) never
/// match these.
const TRANSIENT_ERROR_MARKERS: [&str; 7] = [
    "connection refused",
    "cannot connect",
    "timed out",
    "timeout",
    "unreachable",
    "returned status 5",
    "no suitable infrastructure node",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_state", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionState {
    Created,
    Queued,
    Claimed,
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Created => "CREATED",
            ExecutionState::Queued => "QUEUED",
            ExecutionState::Claimed => "CLAIMED",
            ExecutionState::Started => "STARTED",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
        }
    }
}

/// One step of work: carries its own lease and version.
///
/// Lifecycle: created by the orchestrator, queued, claimed by exactly one
/// worker, started, then terminal. Terminal states null the lease.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Execution {
    #[builder(default = Uuid::new_v4())]
    pub execution_id: Uuid,

    // Identity
    pub tenant_id: Uuid,
    pub application_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub deployment_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub step_execution_id: Option<Uuid>,

    // Execution type
    #[builder(default = "deploy".to_string())]
    pub execution_type: String,
    #[builder(default = "docker".to_string())]
    pub runtime_type: String,

    // Opaque spec document handed to the slot body
    #[builder(default = serde_json::json!({}))]
    pub spec: serde_json::Value,

    // State
    #[builder(default = ExecutionState::Created)]
    pub state: ExecutionState,

    // Lifecycle timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub queued_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub claimed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,

    // Lease management
    #[builder(default, setter(strip_option))]
    pub lease_owner: Option<String>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,

    // Results
    #[builder(default, setter(strip_option))]
    pub deployment_result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    // Retry
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,

    // Priority (higher dispatches first)
    #[builder(default = 0)]
    pub priority: i32,

    // Optimistic concurrency
    #[builder(default = 0)]
    pub version: i32,
}

impl Execution {
    /// CREATED -> QUEUED.
    pub fn queue(&mut self) -> EngineResult<()> {
        if self.state != ExecutionState::Created {
            return Err(EngineError::InvalidState(format!(
                "cannot queue execution in {} state",
                self.state.as_str()
            )));
        }
        self.state = ExecutionState::Queued;
        self.queued_at = Some(Utc::now());
        self.version += 1;
        Ok(())
    }

    /// QUEUED -> CLAIMED (also the recovery path for an expired STARTED row).
    pub fn claim(&mut self, worker_id: &str, lease_seconds: i64) -> EngineResult<()> {
        if !self.is_claimable(Utc::now()) {
            return Err(EngineError::InvalidState(format!(
                "cannot claim execution in {} state",
                self.state.as_str()
            )));
        }
        let now = Utc::now();
        self.state = ExecutionState::Claimed;
        self.lease_owner = Some(worker_id.to_string());
        self.lease_expires_at = Some(now + Duration::seconds(lease_seconds));
        self.claimed_at = Some(now);
        self.version += 1;
        Ok(())
    }

    /// CLAIMED -> STARTED. Requires a live lease owned by `worker_id`.
    pub fn start(&mut self, worker_id: &str) -> EngineResult<()> {
        self.assert_lease(worker_id)?;
        if self.state != ExecutionState::Claimed {
            return Err(EngineError::InvalidState(format!(
                "cannot start execution in {} state",
                self.state.as_str()
            )));
        }
        self.state = ExecutionState::Started;
        self.started_at = Some(Utc::now());
        self.version += 1;
        Ok(())
    }

    /// Transition to a terminal state, clearing the lease.
    pub fn finalize(
        &mut self,
        worker_id: &str,
        final_state: ExecutionState,
        error_message: Option<&str>,
    ) -> EngineResult<()> {
        if !final_state.is_terminal() {
            return Err(EngineError::Validation(format!(
                "{} is not a terminal state",
                final_state.as_str()
            )));
        }
        if self.state.is_terminal() {
            return Err(EngineError::Concurrency(format!(
                "execution {} already finalized",
                self.execution_id
            )));
        }
        self.assert_lease(worker_id)?;
        self.state = final_state;
        self.finished_at = Some(Utc::now());
        if let Some(message) = error_message {
            self.error_message = Some(message.to_string());
        }
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.version += 1;
        Ok(())
    }

    /// Extend the lease expiry (heartbeat). Fails on owner mismatch,
    /// terminal state, or an already expired lease.
    pub fn renew_lease(&mut self, worker_id: &str, lease_seconds: i64) -> EngineResult<()> {
        if self.state.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "cannot renew lease in {} state",
                self.state.as_str()
            )));
        }
        self.assert_lease(worker_id)?;
        self.lease_expires_at = Some(Utc::now() + Duration::seconds(lease_seconds));
        self.version += 1;
        Ok(())
    }

    /// Attach the runtime agent's result document.
    pub fn set_result(&mut self, result: serde_json::Value) {
        self.deployment_result = Some(result);
        self.version += 1;
    }

    /// FAILED -> CREATED, ready to be re-queued by the retry scheduler.
    pub fn reset_for_retry(&mut self) -> EngineResult<()> {
        if self.state != ExecutionState::Failed {
            return Err(EngineError::InvalidState(format!(
                "cannot retry execution in {} state",
                self.state.as_str()
            )));
        }
        self.retry_count += 1;
        self.state = ExecutionState::Created;
        self.finished_at = None;
        self.error_message = None;
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.version += 1;
        Ok(())
    }

    /// Whether `try_claim` would succeed at `now`: QUEUED with a free or
    /// expired lease, or STARTED with an expired lease (crash recovery).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let lease_expired = self.lease_expires_at.map_or(true, |expires| expires <= now);
        match self.state {
            ExecutionState::Queued => lease_expired,
            ExecutionState::Started => self.lease_expires_at.is_some() && lease_expired,
            _ => false,
        }
    }

    pub fn is_lease_valid(&self, worker_id: &str) -> bool {
        self.lease_owner.as_deref() == Some(worker_id)
            && self
                .lease_expires_at
                .map_or(false, |expires| expires > Utc::now())
    }

    pub fn can_retry(&self) -> bool {
        self.state == ExecutionState::Failed && self.retry_count < self.max_retries
    }

    /// Whether the recorded failure is transient (network, timeout, 5xx,
    /// capacity shortage) rather than permanent.
    pub fn is_transient_error(&self) -> bool {
        let Some(message) = &self.error_message else {
            return false;
        };
        let message = message.to_lowercase();
        TRANSIENT_ERROR_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }

    /// Seconds to wait before the next retry attempt.
    pub fn retry_delay(&self) -> i64 {
        let index = (self.retry_count as usize).min(RETRY_BACKOFF_SECONDS.len() - 1);
        RETRY_BACKOFF_SECONDS[index]
    }

    fn assert_lease(&self, worker_id: &str) -> EngineResult<()> {
        match self.lease_owner.as_deref() {
            Some(owner) if owner == worker_id => {}
            Some(owner) => {
                return Err(EngineError::Lease(format!(
                    "execution {} leased by {}, not {}",
                    self.execution_id, owner, worker_id
                )))
            }
            None => {
                return Err(EngineError::Lease(format!(
                    "execution {} has no lease",
                    self.execution_id
                )))
            }
        }
        match self.lease_expires_at {
            Some(expires) if expires > Utc::now() => Ok(()),
            _ => Err(EngineError::Lease(format!(
                "lease on execution {} expired",
                self.execution_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_execution() -> Execution {
        Execution::builder()
            .tenant_id(Uuid::new_v4())
            .application_id(Uuid::new_v4())
            .build()
    }

    fn claimed_execution(worker: &str) -> Execution {
        let mut execution = sample_execution();
        execution.queue().unwrap();
        execution.claim(worker, 30).unwrap();
        execution
    }

    #[test]
    fn new_execution_starts_created_with_version_zero() {
        let execution = sample_execution();
        assert_eq!(execution.state, ExecutionState::Created);
        assert_eq!(execution.version, 0);
        assert!(execution.lease_owner.is_none());
    }

    #[test]
    fn queue_sets_timestamp_and_bumps_version() {
        let mut execution = sample_execution();
        execution.queue().unwrap();
        assert_eq!(execution.state, ExecutionState::Queued);
        assert!(execution.queued_at.is_some());
        assert_eq!(execution.version, 1);
    }

    #[test]
    fn queue_from_queued_is_rejected() {
        let mut execution = sample_execution();
        execution.queue().unwrap();
        assert!(matches!(
            execution.queue(),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn claim_takes_the_lease() {
        let execution = claimed_execution("worker-1");
        assert_eq!(execution.state, ExecutionState::Claimed);
        assert_eq!(execution.lease_owner.as_deref(), Some("worker-1"));
        assert!(execution.lease_expires_at.unwrap() > Utc::now());
        assert_eq!(execution.version, 2);
    }

    #[test]
    fn claim_from_created_is_rejected() {
        let mut execution = sample_execution();
        assert!(execution.claim("worker-1", 30).is_err());
    }

    #[test]
    fn start_requires_lease_owner_match() {
        let mut execution = claimed_execution("worker-1");
        assert!(matches!(
            execution.start("worker-2"),
            Err(EngineError::Lease(_))
        ));
        execution.start("worker-1").unwrap();
        assert_eq!(execution.state, ExecutionState::Started);
    }

    #[test]
    fn finalize_clears_lease_and_sets_finished_at() {
        let mut execution = claimed_execution("worker-1");
        execution.start("worker-1").unwrap();
        execution
            .finalize("worker-1", ExecutionState::Completed, None)
            .unwrap();
        assert_eq!(execution.state, ExecutionState::Completed);
        assert!(execution.finished_at.is_some());
        assert!(execution.lease_owner.is_none());
        assert!(execution.lease_expires_at.is_none());
    }

    #[test]
    fn finalize_twice_is_a_concurrency_error() {
        let mut execution = claimed_execution("worker-1");
        execution.start("worker-1").unwrap();
        execution
            .finalize("worker-1", ExecutionState::Completed, None)
            .unwrap();
        assert!(matches!(
            execution.finalize("worker-1", ExecutionState::Failed, None),
            Err(EngineError::Concurrency(_))
        ));
    }

    #[test]
    fn finalize_to_non_terminal_state_is_rejected() {
        let mut execution = claimed_execution("worker-1");
        assert!(matches!(
            execution.finalize("worker-1", ExecutionState::Queued, None),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn renew_fails_for_wrong_owner_and_expired_lease() {
        let mut execution = claimed_execution("worker-1");
        assert!(execution.renew_lease("worker-2", 30).is_err());

        execution.lease_expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(matches!(
            execution.renew_lease("worker-1", 30),
            Err(EngineError::Lease(_))
        ));
    }

    #[test]
    fn version_strictly_increases_across_the_lifecycle() {
        let mut execution = sample_execution();
        let mut last = execution.version;
        execution.queue().unwrap();
        assert!(execution.version > last);
        last = execution.version;
        execution.claim("worker-1", 30).unwrap();
        assert!(execution.version > last);
        last = execution.version;
        execution.start("worker-1").unwrap();
        assert!(execution.version > last);
        last = execution.version;
        execution
            .finalize("worker-1", ExecutionState::Completed, None)
            .unwrap();
        assert!(execution.version > last);
    }

    #[test]
    fn started_with_expired_lease_is_claimable() {
        let mut execution = claimed_execution("worker-1");
        execution.start("worker-1").unwrap();
        assert!(!execution.is_claimable(Utc::now()));

        execution.lease_expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(execution.is_claimable(Utc::now()));
    }

    #[test]
    fn connection_and_capacity_errors_are_transient() {
        let mut execution = sample_execution();
        execution.error_message =
            Some("cannot connect to runtime agent at http://10.0.1.50:9000".into());
        assert!(execution.is_transient_error());

        execution.error_message = Some("No suitable infrastructure node available".into());
        assert!(execution.is_transient_error());

        execution.error_message = Some("runtime agent returned status 503: unavailable".into());
        assert!(execution.is_transient_error());
    }

    #[test]
    fn rejected_requests_are_permanent() {
        let mut execution = sample_execution();
        execution.error_message =
            Some("runtime agent rejected request: status 404 - image not found".into());
        assert!(!execution.is_transient_error());
        assert!(execution.error_message.is_some());
    }

    #[test]
    fn retry_delay_follows_backoff_schedule() {
        let mut execution = sample_execution();
        assert_eq!(execution.retry_delay(), 10);
        execution.retry_count = 1;
        assert_eq!(execution.retry_delay(), 30);
        execution.retry_count = 2;
        assert_eq!(execution.retry_delay(), 90);
        execution.retry_count = 7;
        assert_eq!(execution.retry_delay(), 90);
    }

    #[test]
    fn reset_for_retry_requeues_with_cleared_failure_fields() {
        let mut execution = claimed_execution("worker-1");
        execution.start("worker-1").unwrap();
        execution
            .finalize("worker-1", ExecutionState::Failed, Some("timed out"))
            .unwrap();

        execution.reset_for_retry().unwrap();
        assert_eq!(execution.state, ExecutionState::Created);
        assert_eq!(execution.retry_count, 1);
        assert!(execution.finished_at.is_none());
        assert!(execution.error_message.is_none());
        assert!(execution.lease_owner.is_none());
    }
}
