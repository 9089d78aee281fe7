//! EngineKernel: the explicitly wired dependency graph.
//!
//! Every process builds one kernel at startup and passes it down - there
//! is no ambient global state. The kernel owns the store implementations
//! behind trait objects so the same orchestrator, executor, and
//! reconcilers run against Postgres in production and the in-memory
//! stores in tests.

use std::sync::Arc;

use sqlx::PgPool;

use crate::domain::{DomainService, DomainStore, PostgresDomainStore};
use crate::executions::{ExecutionStore, PostgresExecutionStore};
use crate::executor::{ContainerRuntime, HttpRuntime};
use crate::nodes::{NodeRegistry, NodeStore, PostgresNodeStore};
use crate::orchestrator::DeploymentOrchestrator;

pub struct EngineKernel {
    pub executions: Arc<dyn ExecutionStore>,
    pub nodes: Arc<dyn NodeStore>,
    pub domain: Arc<dyn DomainStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl EngineKernel {
    /// Production wiring: every store on the given pool, HTTP gateway to
    /// the runtime agents.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            executions: Arc::new(PostgresExecutionStore::new(pool.clone())),
            nodes: Arc::new(PostgresNodeStore::new(pool.clone())),
            domain: Arc::new(PostgresDomainStore::new(pool)),
            runtime: Arc::new(HttpRuntime::new()),
        }
    }

    /// Custom wiring, used by the in-memory test kernel.
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        nodes: Arc<dyn NodeStore>,
        domain: Arc<dyn DomainStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            executions,
            nodes,
            domain,
            runtime,
        }
    }

    pub fn node_registry(&self) -> NodeRegistry {
        NodeRegistry::new(Arc::clone(&self.nodes))
    }

    pub fn domain_service(&self) -> DomainService {
        DomainService::new(Arc::clone(&self.domain))
    }

    pub fn orchestrator(&self) -> DeploymentOrchestrator {
        DeploymentOrchestrator::new(
            Arc::clone(&self.domain),
            Arc::clone(&self.executions),
            self.node_registry(),
        )
    }
}
