//! In-memory execution store with the same contract as the Postgres one.
//!
//! Used by the integration tests and for running the engine against no
//! database in local development. A single mutex stands in for the row
//! locks; the semantics (claim atomicity, lease guards, optimistic
//! versioning) are identical.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};

use super::model::{Execution, ExecutionState};
use super::store::ExecutionStore;

#[derive(Default)]
pub struct InMemoryExecutionStore {
    inner: Mutex<HashMap<Uuid, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: &Execution) -> EngineResult<()> {
        let mut store = self.inner.lock().await;
        if store.contains_key(&execution.execution_id) {
            return Err(EngineError::AlreadyExists(format!(
                "execution {}",
                execution.execution_id
            )));
        }
        store.insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> EngineResult<Option<Execution>> {
        Ok(self.inner.lock().await.get(&execution_id).cloned())
    }

    async fn update(&self, execution: &Execution) -> EngineResult<()> {
        let mut store = self.inner.lock().await;
        let stored = store
            .get(&execution.execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution.execution_id)))?;

        if stored.version != execution.version - 1 {
            return Err(EngineError::Concurrency(format!(
                "execution {} changed since version {}",
                execution.execution_id,
                execution.version - 1
            )));
        }
        store.insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn list_by_state(
        &self,
        state: ExecutionState,
        limit: i64,
    ) -> EngineResult<Vec<Execution>> {
        let store = self.inner.lock().await;
        let mut matching: Vec<Execution> = store
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn list_by_deployment(&self, deployment_id: Uuid) -> EngineResult<Vec<Execution>> {
        let store = self.inner.lock().await;
        let mut matching: Vec<Execution> = store
            .values()
            .filter(|e| e.deployment_id == Some(deployment_id))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.created_at);
        Ok(matching)
    }

    async fn list_recoverable(&self, limit: i64) -> EngineResult<Vec<Execution>> {
        let now = Utc::now();
        let store = self.inner.lock().await;
        let mut matching: Vec<Execution> = store
            .values()
            .filter(|e| {
                e.state == ExecutionState::Started
                    && e.lease_expires_at.map_or(false, |expires| expires <= now)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.lease_expires_at);
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn try_claim(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> EngineResult<bool> {
        let mut store = self.inner.lock().await;
        let Some(execution) = store.get_mut(&execution_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        if !execution.is_claimable(now) {
            return Ok(false);
        }
        execution.state = ExecutionState::Claimed;
        execution.lease_owner = Some(worker_id.to_string());
        execution.lease_expires_at = Some(now + chrono::Duration::seconds(lease_seconds));
        execution.claimed_at = Some(now);
        execution.version += 1;
        Ok(true)
    }

    async fn start(&self, execution_id: Uuid, worker_id: &str) -> EngineResult<()> {
        let mut store = self.inner.lock().await;
        let execution = store
            .get_mut(&execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
        execution.start(worker_id)
    }

    async fn renew_lease(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> EngineResult<()> {
        let mut store = self.inner.lock().await;
        let execution = store
            .get_mut(&execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
        execution.renew_lease(worker_id, lease_seconds)
    }

    async fn finalize(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        final_state: ExecutionState,
        error_message: Option<&str>,
    ) -> EngineResult<()> {
        let mut store = self.inner.lock().await;
        let execution = store
            .get_mut(&execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
        execution.finalize(worker_id, final_state, error_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_execution() -> Execution {
        let mut execution = Execution::builder()
            .tenant_id(Uuid::new_v4())
            .application_id(Uuid::new_v4())
            .build();
        execution.queue().unwrap();
        execution
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryExecutionStore::new();
        let execution = queued_execution();
        store.create(&execution).await.unwrap();
        assert!(matches!(
            store.create(&execution).await,
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn claim_on_missing_row_returns_false() {
        let store = InMemoryExecutionStore::new();
        assert!(!store.try_claim(Uuid::new_v4(), "w1", 30).await.unwrap());
    }

    #[tokio::test]
    async fn only_one_of_two_concurrent_claims_wins() {
        let store = std::sync::Arc::new(InMemoryExecutionStore::new());
        let execution = queued_execution();
        let id = execution.execution_id;
        store.create(&execution).await.unwrap();

        let (a, b) = tokio::join!(store.try_claim(id, "w1", 30), store.try_claim(id, "w2", 30));
        assert!(a.unwrap() != b.unwrap(), "exactly one claim must win");
    }

    #[tokio::test]
    async fn update_with_stale_version_is_a_concurrency_error() {
        let store = InMemoryExecutionStore::new();
        let execution = queued_execution();
        store.create(&execution).await.unwrap();

        let mut stale = execution.clone();
        stale.version += 2;
        assert!(matches!(
            store.update(&stale).await,
            Err(EngineError::Concurrency(_))
        ));
    }

    #[tokio::test]
    async fn recovery_claims_expired_started_row() {
        let store = InMemoryExecutionStore::new();
        let mut execution = queued_execution();
        execution.claim("w1", 30).unwrap();
        execution.start("w1").unwrap();
        execution.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        store.create(&execution).await.unwrap();

        let recoverable = store.list_recoverable(10).await.unwrap();
        assert_eq!(recoverable.len(), 1);

        assert!(store
            .try_claim(execution.execution_id, "w2", 30)
            .await
            .unwrap());
        let recovered = store.get(execution.execution_id).await.unwrap().unwrap();
        assert_eq!(recovered.state, ExecutionState::Claimed);
        assert_eq!(recovered.lease_owner.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn queued_rows_dispatch_priority_desc_then_created_asc() {
        let store = InMemoryExecutionStore::new();
        let mut low = queued_execution();
        low.priority = 0;
        let mut high = queued_execution();
        high.priority = 5;
        high.created_at = low.created_at + chrono::Duration::seconds(1);
        store.create(&low).await.unwrap();
        store.create(&high).await.unwrap();

        let listed = store
            .list_by_state(ExecutionState::Queued, 10)
            .await
            .unwrap();
        assert_eq!(listed[0].execution_id, high.execution_id);
        assert_eq!(listed[1].execution_id, low.execution_id);
    }
}
