use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::EngineResult;

use super::models::{
    Application, ApplicationTemplate, DeployedResource, Deployment, HealthStatus,
};

/// Persistence for the application lifecycle: templates, applications,
/// deployments, and deployed resources.
#[async_trait]
pub trait DomainStore: Send + Sync {
    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    async fn create_template(&self, template: &ApplicationTemplate) -> EngineResult<()>;

    async fn get_template(
        &self,
        template_id: &str,
        version: &str,
    ) -> EngineResult<Option<ApplicationTemplate>>;

    /// Latest active version of a template.
    async fn get_latest_template(
        &self,
        template_id: &str,
    ) -> EngineResult<Option<ApplicationTemplate>>;

    // ------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------

    async fn create_application(&self, application: &Application) -> EngineResult<()>;

    async fn get_application(&self, application_id: Uuid) -> EngineResult<Option<Application>>;

    async fn update_application(&self, application: &Application) -> EngineResult<()>;

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    async fn create_deployment(&self, deployment: &Deployment) -> EngineResult<()>;

    async fn get_deployment(&self, deployment_id: Uuid) -> EngineResult<Option<Deployment>>;

    async fn update_deployment(&self, deployment: &Deployment) -> EngineResult<()>;

    /// Deployments currently in DEPLOYING, oldest first - the status
    /// updater's work list.
    async fn list_deploying_deployments(&self) -> EngineResult<Vec<Uuid>>;

    // ------------------------------------------------------------------
    // Deployed resources
    // ------------------------------------------------------------------

    async fn create_resource(&self, resource: &DeployedResource) -> EngineResult<()>;

    async fn get_resource(&self, resource_id: Uuid) -> EngineResult<Option<DeployedResource>>;

    /// The resource row tracking a given execution (its id is stored in
    /// the resource spec).
    async fn find_resource_by_execution(
        &self,
        execution_id: Uuid,
    ) -> EngineResult<Option<DeployedResource>>;

    /// Running containers with a real external id, ordered stalest health
    /// check first - the health monitor's work list.
    async fn list_health_checkable(&self) -> EngineResult<Vec<DeployedResource>>;

    /// Record the agent's deploy result: external id, status, and the
    /// result document merged into the resource spec.
    async fn attach_deploy_result(
        &self,
        resource_id: Uuid,
        external_id: &str,
        status: &str,
        deployment_result: &serde_json::Value,
    ) -> EngineResult<()>;

    /// Write the outcome of one health probe.
    async fn record_health_check(
        &self,
        resource_id: Uuid,
        health: HealthStatus,
        consecutive_failures: i32,
        checked_at: DateTime<Utc>,
    ) -> EngineResult<()>;

    /// After a successful restart: health STARTING, failure counter zeroed.
    async fn reset_after_restart(&self, resource_id: Uuid) -> EngineResult<()>;
}
