//! PostgreSQL-backed execution store.
//!
//! Guarded transitions lock the target row with `SELECT ... FOR UPDATE`,
//! re-check state and lease under the lock, and write in the same
//! transaction. There is no poll-scan-then-update anywhere.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};

use super::model::{Execution, ExecutionState};
use super::store::ExecutionStore;

pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock and fetch a row inside `tx`. Returns None when the row is missing.
    async fn lock_row(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        execution_id: Uuid,
    ) -> EngineResult<Option<Execution>> {
        let execution = sqlx::query_as::<_, Execution>(
            r#"
            SELECT execution_id, tenant_id, application_id, deployment_id, step_execution_id,
                   execution_type, runtime_type, spec, state, created_at, queued_at, claimed_at,
                   started_at, finished_at, lease_owner, lease_expires_at, deployment_result,
                   error_message, retry_count, max_retries, priority, version
            FROM executions
            WHERE execution_id = $1
            FOR UPDATE
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(execution)
    }

    fn assert_lease(execution: &Execution, worker_id: &str) -> EngineResult<()> {
        match execution.lease_owner.as_deref() {
            Some(owner) if owner == worker_id => {}
            Some(owner) => {
                return Err(EngineError::Lease(format!(
                    "execution {} leased by {}, not {}",
                    execution.execution_id, owner, worker_id
                )))
            }
            None => {
                return Err(EngineError::Lease(format!(
                    "execution {} has no lease",
                    execution.execution_id
                )))
            }
        }
        match execution.lease_expires_at {
            Some(expires) if expires > chrono::Utc::now() => Ok(()),
            _ => Err(EngineError::Lease(format!(
                "lease on execution {} expired",
                execution.execution_id
            ))),
        }
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn create(&self, execution: &Execution) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions (
                execution_id, tenant_id, application_id, deployment_id, step_execution_id,
                execution_type, runtime_type, spec, state, created_at, queued_at, claimed_at,
                started_at, finished_at, lease_owner, lease_expires_at, deployment_result,
                error_message, retry_count, max_retries, priority, version
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22
            )
            "#,
        )
        .bind(execution.execution_id)
        .bind(execution.tenant_id)
        .bind(execution.application_id)
        .bind(execution.deployment_id)
        .bind(execution.step_execution_id)
        .bind(&execution.execution_type)
        .bind(&execution.runtime_type)
        .bind(&execution.spec)
        .bind(execution.state)
        .bind(execution.created_at)
        .bind(execution.queued_at)
        .bind(execution.claimed_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(&execution.lease_owner)
        .bind(execution.lease_expires_at)
        .bind(&execution.deployment_result)
        .bind(&execution.error_message)
        .bind(execution.retry_count)
        .bind(execution.max_retries)
        .bind(execution.priority)
        .bind(execution.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                EngineError::AlreadyExists(format!("execution {}", execution.execution_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, execution_id: Uuid) -> EngineResult<Option<Execution>> {
        let execution = sqlx::query_as::<_, Execution>(
            r#"
            SELECT execution_id, tenant_id, application_id, deployment_id, step_execution_id,
                   execution_type, runtime_type, spec, state, created_at, queued_at, claimed_at,
                   started_at, finished_at, lease_owner, lease_expires_at, deployment_result,
                   error_message, retry_count, max_retries, priority, version
            FROM executions
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(execution)
    }

    async fn update(&self, execution: &Execution) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions SET
                execution_type = $2, runtime_type = $3, spec = $4, state = $5,
                queued_at = $6, claimed_at = $7, started_at = $8, finished_at = $9,
                lease_owner = $10, lease_expires_at = $11, deployment_result = $12,
                error_message = $13, retry_count = $14, max_retries = $15,
                priority = $16, version = $17
            WHERE execution_id = $1 AND version = $17 - 1
            "#,
        )
        .bind(execution.execution_id)
        .bind(&execution.execution_type)
        .bind(&execution.runtime_type)
        .bind(&execution.spec)
        .bind(execution.state)
        .bind(execution.queued_at)
        .bind(execution.claimed_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(&execution.lease_owner)
        .bind(execution.lease_expires_at)
        .bind(&execution.deployment_result)
        .bind(&execution.error_message)
        .bind(execution.retry_count)
        .bind(execution.max_retries)
        .bind(execution.priority)
        .bind(execution.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Concurrency(format!(
                "execution {} changed since version {}",
                execution.execution_id,
                execution.version - 1
            )));
        }
        Ok(())
    }

    async fn list_by_state(
        &self,
        state: ExecutionState,
        limit: i64,
    ) -> EngineResult<Vec<Execution>> {
        let executions = sqlx::query_as::<_, Execution>(
            r#"
            SELECT execution_id, tenant_id, application_id, deployment_id, step_execution_id,
                   execution_type, runtime_type, spec, state, created_at, queued_at, claimed_at,
                   started_at, finished_at, lease_owner, lease_expires_at, deployment_result,
                   error_message, retry_count, max_retries, priority, version
            FROM executions
            WHERE state = $1
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(state)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    async fn list_by_deployment(&self, deployment_id: Uuid) -> EngineResult<Vec<Execution>> {
        let executions = sqlx::query_as::<_, Execution>(
            r#"
            SELECT execution_id, tenant_id, application_id, deployment_id, step_execution_id,
                   execution_type, runtime_type, spec, state, created_at, queued_at, claimed_at,
                   started_at, finished_at, lease_owner, lease_expires_at, deployment_result,
                   error_message, retry_count, max_retries, priority, version
            FROM executions
            WHERE deployment_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    async fn list_recoverable(&self, limit: i64) -> EngineResult<Vec<Execution>> {
        let executions = sqlx::query_as::<_, Execution>(
            r#"
            SELECT execution_id, tenant_id, application_id, deployment_id, step_execution_id,
                   execution_type, runtime_type, spec, state, created_at, queued_at, claimed_at,
                   started_at, finished_at, lease_owner, lease_expires_at, deployment_result,
                   error_message, retry_count, max_retries, priority, version
            FROM executions
            WHERE state = 'STARTED' AND lease_expires_at <= NOW()
            ORDER BY lease_expires_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    async fn try_claim(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(execution) = self.lock_row(&mut tx, execution_id).await? else {
            return Ok(false);
        };

        if !execution.is_claimable(chrono::Utc::now()) {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE executions
            SET state = $2,
                lease_owner = $3,
                lease_expires_at = NOW() + ($4 || ' seconds')::INTERVAL,
                claimed_at = NOW(),
                version = version + 1
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(ExecutionState::Claimed)
        .bind(worker_id)
        .bind(lease_seconds.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn start(&self, execution_id: Uuid, worker_id: &str) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let execution = self
            .lock_row(&mut tx, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        Self::assert_lease(&execution, worker_id)?;
        if execution.state != ExecutionState::Claimed {
            return Err(EngineError::InvalidState(format!(
                "cannot start execution in {} state",
                execution.state.as_str()
            )));
        }

        sqlx::query(
            r#"
            UPDATE executions
            SET state = $2, started_at = NOW(), version = version + 1
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(ExecutionState::Started)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn renew_lease(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let execution = self
            .lock_row(&mut tx, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        if execution.state.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "cannot renew lease in {} state",
                execution.state.as_str()
            )));
        }
        Self::assert_lease(&execution, worker_id)?;

        sqlx::query(
            r#"
            UPDATE executions
            SET lease_expires_at = NOW() + ($2 || ' seconds')::INTERVAL,
                version = version + 1
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(lease_seconds.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finalize(
        &self,
        execution_id: Uuid,
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

        let mut tx = self.pool.begin().await?;

        let execution = self
            .lock_row(&mut tx, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        if execution.state.is_terminal() {
            return Err(EngineError::Concurrency(format!(
                "execution {} already finalized",
                execution_id
            )));
        }
        Self::assert_lease(&execution, worker_id)?;

        sqlx::query(
            r#"
            UPDATE executions
            SET state = $2,
                finished_at = NOW(),
                error_message = COALESCE($3, error_message),
                lease_owner = NULL,
                lease_expires_at = NULL,
                version = version + 1
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(final_state)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
