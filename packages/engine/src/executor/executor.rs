//! Executor main loop and slot bodies.
//!
//! One long-lived task per executor plus one task per active slot. The
//! main loop renews every running execution's lease each tick, then fills
//! free slots - queued work first, crashed workers' recoverable rows
//! second. Slot bodies call the runtime agent, attach the result, and
//! finalize. Losing a lease at any point means abandoning the slot
//! silently; the recovery path re-leases the row elsewhere.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};
use crate::domain::DomainStore;
use crate::executions::{Execution, ExecutionState, ExecutionStore};

use super::runtime::ContainerRuntime;
use super::slots::SlotManager;

/// Executor configuration. `lease_seconds >= 3 * poll_interval` is the
/// operational assumption - that margin is what survives transient
/// database hiccups between heartbeats.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Stable identity; lease ownership is keyed on this.
    pub worker_id: String,
    pub poll_interval: Duration,
    pub max_slots: usize,
    pub lease_seconds: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("executor-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(2),
            max_slots: 2,
            lease_seconds: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

struct Inner {
    executions: Arc<dyn ExecutionStore>,
    domain: Arc<dyn DomainStore>,
    runtime: Arc<dyn ContainerRuntime>,
    config: ExecutorConfig,
    slots: Mutex<SlotManager>,
}

/// Cheap handle over the executor's shared state; slot tasks carry a clone.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        domain: Arc<dyn DomainStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: ExecutorConfig,
    ) -> Self {
        let slots = Mutex::new(SlotManager::new(config.max_slots));
        Self {
            inner: Arc::new(Inner {
                executions,
                domain,
                runtime,
                config,
                slots,
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn active_slots(&self) -> usize {
        self.inner
            .slots
            .lock()
            .expect("slot lock poisoned")
            .active_count()
    }

    /// Run until the token is cancelled. Cancellation is cooperative:
    /// observed between iterations, with in-flight slot bodies given a
    /// grace period to finish their current step.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let config = &self.inner.config;
        info!(
            worker_id = %config.worker_id,
            max_slots = config.max_slots,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            lease_seconds = config.lease_seconds,
            "executor starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.tick().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }

        self.drain().await;
        info!(worker_id = %self.inner.config.worker_id, "executor stopped");
        Ok(())
    }

    /// One iteration of the main loop: heartbeat, then fill a free slot.
    /// Public so tests can drive the executor deterministically.
    pub async fn tick(&self) {
        self.renew_running_leases().await;
        if let Err(e) = self.claim_and_dispatch().await {
            error!(worker_id = %self.inner.config.worker_id, error = %e, "error in executor loop");
        }
    }

    /// Wait for in-flight slot bodies to finish, bounded.
    async fn drain(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        loop {
            let active = self.active_slots();
            if active == 0 || std::time::Instant::now() >= deadline {
                if active > 0 {
                    warn!(active, "executor stopping with slots still bound; leases will expire");
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn renew_running_leases(&self) {
        let active = {
            let slots = self.inner.slots.lock().expect("slot lock poisoned");
            slots.active_executions()
        };
        let config = &self.inner.config;

        for execution_id in active {
            match self
                .inner
                .executions
                .renew_lease(execution_id, &config.worker_id, config.lease_seconds)
                .await
            {
                Ok(()) => {}
                Err(EngineError::Lease(_)) | Err(EngineError::NotFound(_)) => {
                    // We no longer own it. Do not finalize - just let go.
                    warn!(
                        worker_id = %config.worker_id,
                        execution_id = %execution_id,
                        "lost lease, abandoning slot"
                    );
                    self.release_slot(execution_id);
                }
                Err(e) => {
                    // Transient store trouble; the lease margin absorbs it.
                    warn!(execution_id = %execution_id, error = %e, "lease renewal failed");
                }
            }
        }
    }

    async fn claim_and_dispatch(&self) -> EngineResult<()> {
        let free_slot = {
            let slots = self.inner.slots.lock().expect("slot lock poisoned");
            slots.free_slot()
        };
        if free_slot.is_none() {
            return Ok(());
        }

        // Queued work first.
        for execution in self
            .inner
            .executions
            .list_by_state(ExecutionState::Queued, 1)
            .await?
        {
            if self.try_dispatch(execution.execution_id).await? {
                return Ok(());
            }
        }

        // Nothing queued: pick up crashed workers' leftovers. The claim is
        // the same atomic operation; an expired STARTED row lands back in
        // CLAIMED under our lease.
        for execution in self.inner.executions.list_recoverable(1).await? {
            info!(
                worker_id = %self.inner.config.worker_id,
                execution_id = %execution.execution_id,
                "recovering execution with expired lease"
            );
            if self.try_dispatch(execution.execution_id).await? {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Claim, start, bind, and spawn the slot body. Returns true when the
    /// execution was dispatched; false when another worker won the claim.
    async fn try_dispatch(&self, execution_id: Uuid) -> EngineResult<bool> {
        let config = &self.inner.config;
        let claimed = self
            .inner
            .executions
            .try_claim(execution_id, &config.worker_id, config.lease_seconds)
            .await?;
        if !claimed {
            debug!(execution_id = %execution_id, "claim lost to another worker");
            return Ok(false);
        }

        match self
            .inner
            .executions
            .start(execution_id, &config.worker_id)
            .await
        {
            Ok(()) => {}
            Err(EngineError::Lease(_)) | Err(EngineError::InvalidState(_)) => {
                // Claimed but lost before starting; recovery picks it up.
                warn!(execution_id = %execution_id, "claimed execution but could not start it");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let bound = {
            let mut slots = self.inner.slots.lock().expect("slot lock poisoned");
            match slots.free_slot() {
                Some(slot) => slots.bind(slot, execution_id),
                None => false,
            }
        };
        if !bound {
            // Slot raced away between the check and the bind; abandon and
            // let the lease expire back into recovery.
            warn!(execution_id = %execution_id, "no free slot after claim");
            return Ok(false);
        }

        info!(
            worker_id = %config.worker_id,
            execution_id = %execution_id,
            "dispatched execution"
        );

        let worker = self.clone();
        tokio::spawn(async move {
            worker.slot_body(execution_id).await;
        });

        Ok(true)
    }

    /// Body of one slot task. Never panics the executor: every outcome is
    /// a finalize, an abandon, or a logged error, and the slot is always
    /// released.
    async fn slot_body(&self, execution_id: Uuid) {
        let result = self.run_execution(execution_id).await;

        match result {
            Ok(()) => {
                info!(execution_id = %execution_id, "execution completed");
            }
            Err(e) if e.is_lease() => {
                // Lost ownership mid-flight. The recovery path owns the row
                // now; finalizing here would be writing with a dead lease.
                warn!(execution_id = %execution_id, "lease lost during execution, abandoning");
            }
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "execution failed");
                if let Err(finalize_error) = self
                    .inner
                    .executions
                    .finalize(
                        execution_id,
                        &self.inner.config.worker_id,
                        ExecutionState::Failed,
                        Some(&e.to_string()),
                    )
                    .await
                {
                    if !finalize_error.is_lease() {
                        error!(
                            execution_id = %execution_id,
                            error = %finalize_error,
                            "failed to finalize execution"
                        );
                    }
                }
            }
        }

        self.release_slot(execution_id);
    }

    async fn run_execution(&self, execution_id: Uuid) -> EngineResult<()> {
        let execution = self
            .inner
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        let agent_url = execution
            .spec
            .get("agent_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Validation("agent_url required in spec".into()))?
            .to_string();
        let node_id = execution
            .spec
            .get("node_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Validation("node_id required in spec".into()))?
            .to_string();
        let container_spec = execution
            .spec
            .get("container_spec")
            .ok_or_else(|| EngineError::Validation("container_spec required in spec".into()))?
            .clone();

        let deployed = self
            .inner
            .runtime
            .deploy(execution_id, &agent_url, &container_spec)
            .await
            .map_err(|e| EngineError::Runtime(e.to_string()))?;

        let result = json!({
            "container_id": deployed.container_id,
            "container_name": deployed.container_name,
            "status": deployed.status,
            "internal_ip": deployed.internal_ip,
            "ports": deployed.ports,
            "node_id": node_id,
            "agent_url": agent_url,
        });

        // The resource row precedes completion; flip it to running with the
        // agent-assigned id so the health monitor can see it.
        if let Some(resource) = self
            .inner
            .domain
            .find_resource_by_execution(execution_id)
            .await?
        {
            self.inner
                .domain
                .attach_deploy_result(
                    resource.resource_id,
                    &deployed.container_id,
                    "running",
                    &result,
                )
                .await?;
        }

        self.attach_result(execution_id, result).await?;

        self.inner
            .executions
            .finalize(
                execution_id,
                &self.inner.config.worker_id,
                ExecutionState::Completed,
                None,
            )
            .await
    }

    /// Attach the result document with an optimistic update, retrying once:
    /// a concurrent heartbeat may have bumped the version under us.
    async fn attach_result(
        &self,
        execution_id: Uuid,
        result: serde_json::Value,
    ) -> EngineResult<()> {
        let mut attempt = 0;
        loop {
            let mut execution: Execution = self
                .inner
                .executions
                .get(execution_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

            execution.set_result(result.clone());
            match self.inner.executions.update(&execution).await {
                Ok(()) => return Ok(()),
                Err(EngineError::Concurrency(_)) if attempt == 0 => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn release_slot(&self, execution_id: Uuid) {
        let mut slots = self.inner.slots.lock().expect("slot lock poisoned");
        slots.release_execution(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_operational_assumption() {
        let config = ExecutorConfig::default();
        assert!(config.worker_id.starts_with("executor-"));
        // lease_seconds >= 3 * poll_interval
        assert!(config.lease_seconds as u64 >= 3 * config.poll_interval.as_secs());
    }

    #[test]
    fn config_with_worker_id_keeps_defaults() {
        let config = ExecutorConfig::with_worker_id("worker-1");
        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.max_slots, 2);
    }
}
