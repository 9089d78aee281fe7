//! Persistence contract for executions.

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::EngineResult;

use super::model::{Execution, ExecutionState};

/// Store for execution rows. The store is the sole writer of execution
/// state; every operation is a single atomic transaction, and lease fields
/// are only ever written together with state fields.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution. Fails with `AlreadyExists` on a duplicate id.
    async fn create(&self, execution: &Execution) -> EngineResult<()>;

    /// Fetch by id.
    async fn get(&self, execution_id: Uuid) -> EngineResult<Option<Execution>>;

    /// Optimistic update: matches on `(id, version - 1)` and fails with
    /// `Concurrency` otherwise. Used outside the claim/finalize fast path
    /// only - attaching the result document and the retry reset.
    async fn update(&self, execution: &Execution) -> EngineResult<()>;

    /// List executions in `state`, ordered priority-desc then created-asc
    /// so a claim stampede is deterministic and starvation-free.
    async fn list_by_state(
        &self,
        state: ExecutionState,
        limit: i64,
    ) -> EngineResult<Vec<Execution>>;

    /// All executions belonging to a deployment, oldest first.
    async fn list_by_deployment(&self, deployment_id: Uuid) -> EngineResult<Vec<Execution>>;

    /// Executions in STARTED whose lease has expired - crashed workers'
    /// leftovers, ready for recovery.
    async fn list_recoverable(&self, limit: i64) -> EngineResult<Vec<Execution>>;

    /// Atomically claim an execution under a fresh lease.
    ///
    /// The claim is polymorphic: it succeeds for a QUEUED row with a free
    /// or expired lease, and for a STARTED row whose lease expired (crash
    /// recovery) - both land in CLAIMED in the same atomic operation. All
    /// checks and writes happen under the row lock. Returns false (never
    /// errors) when the row is missing, in the wrong state, or lease-live.
    async fn try_claim(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> EngineResult<bool>;

    /// CLAIMED -> STARTED, guarded by lease ownership and liveness.
    async fn start(&self, execution_id: Uuid, worker_id: &str) -> EngineResult<()>;

    /// Extend the lease (heartbeat). Fails with `Lease` on owner mismatch
    /// or expiry, `InvalidState` on a terminal row.
    async fn renew_lease(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> EngineResult<()>;

    /// Transition to COMPLETED / FAILED / CANCELLED, set `finished_at`,
    /// record the error message if any, and clear the lease.
    async fn finalize(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        final_state: ExecutionState,
        error_message: Option<&str>,
    ) -> EngineResult<()>;
}
