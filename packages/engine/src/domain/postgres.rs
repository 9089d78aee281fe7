//! PostgreSQL-backed domain store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};

use super::models::{
    Application, ApplicationTemplate, DeployedResource, Deployment, HealthStatus,
};
use super::store::DomainStore;

pub struct PostgresDomainStore {
    pool: PgPool,
}

impl PostgresDomainStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DomainStore for PostgresDomainStore {
    async fn create_template(&self, template: &ApplicationTemplate) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO application_templates (
                template_id, version, name, description, category,
                deployment_steps, required_inputs, active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&template.template_id)
        .bind(&template.version)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.category)
        .bind(Json(&template.deployment_steps))
        .bind(Json(&template.required_inputs))
        .bind(template.active)
        .bind(template.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(EngineError::AlreadyExists(format!(
                    "template {} version {}",
                    template.template_id, template.version
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_template(
        &self,
        template_id: &str,
        version: &str,
    ) -> EngineResult<Option<ApplicationTemplate>> {
        let template = sqlx::query_as::<_, ApplicationTemplate>(
            r#"
            SELECT template_id, version, name, description, category,
                   deployment_steps, required_inputs, active, created_at
            FROM application_templates
            WHERE template_id = $1 AND version = $2
            "#,
        )
        .bind(template_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(template)
    }

    async fn get_latest_template(
        &self,
        template_id: &str,
    ) -> EngineResult<Option<ApplicationTemplate>> {
        let template = sqlx::query_as::<_, ApplicationTemplate>(
            r#"
            SELECT template_id, version, name, description, category,
                   deployment_steps, required_inputs, active, created_at
            FROM application_templates
            WHERE template_id = $1 AND active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(template)
    }

    async fn create_application(&self, application: &Application) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO applications (
                application_id, tenant_id, template_id, template_version, name, description,
                user_inputs, status, current_deployment_id, public_url, health_status,
                created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(application.application_id)
        .bind(application.tenant_id)
        .bind(&application.template_id)
        .bind(&application.template_version)
        .bind(&application.name)
        .bind(&application.description)
        .bind(&application.user_inputs)
        .bind(application.status)
        .bind(application.current_deployment_id)
        .bind(&application.public_url)
        .bind(application.health_status)
        .bind(application.created_at)
        .bind(application.updated_at)
        .bind(application.deleted_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                EngineError::AlreadyExists(format!("application {}", application.application_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_application(&self, application_id: Uuid) -> EngineResult<Option<Application>> {
        let application = sqlx::query_as::<_, Application>(
            r#"
            SELECT application_id, tenant_id, template_id, template_version, name, description,
                   user_inputs, status, current_deployment_id, public_url, health_status,
                   created_at, updated_at, deleted_at
            FROM applications
            WHERE application_id = $1
            "#,
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(application)
    }

    async fn update_application(&self, application: &Application) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE applications SET
                name = $2, description = $3, user_inputs = $4, status = $5,
                current_deployment_id = $6, public_url = $7, health_status = $8,
                updated_at = NOW(), deleted_at = $9
            WHERE application_id = $1
            "#,
        )
        .bind(application.application_id)
        .bind(&application.name)
        .bind(&application.description)
        .bind(&application.user_inputs)
        .bind(application.status)
        .bind(application.current_deployment_id)
        .bind(&application.public_url)
        .bind(application.health_status)
        .bind(application.deleted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!(
                "application {}",
                application.application_id
            )));
        }
        Ok(())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO deployments (
                deployment_id, application_id, tenant_id, template_id, template_version,
                resolved_config, status, current_step, total_steps, public_url,
                error_message, rolled_back, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(deployment.deployment_id)
        .bind(deployment.application_id)
        .bind(deployment.tenant_id)
        .bind(&deployment.template_id)
        .bind(&deployment.template_version)
        .bind(&deployment.resolved_config)
        .bind(deployment.status)
        .bind(deployment.current_step)
        .bind(deployment.total_steps)
        .bind(&deployment.public_url)
        .bind(&deployment.error_message)
        .bind(deployment.rolled_back)
        .bind(deployment.created_at)
        .bind(deployment.started_at)
        .bind(deployment.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                EngineError::AlreadyExists(format!("deployment {}", deployment.deployment_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_deployment(&self, deployment_id: Uuid) -> EngineResult<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>(
            r#"
            SELECT deployment_id, application_id, tenant_id, template_id, template_version,
                   resolved_config, status, current_step, total_steps, public_url,
                   error_message, rolled_back, created_at, started_at, completed_at
            FROM deployments
            WHERE deployment_id = $1
            "#,
        )
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(deployment)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments SET
                resolved_config = $2, status = $3, current_step = $4, total_steps = $5,
                public_url = $6, error_message = $7, rolled_back = $8,
                started_at = $9, completed_at = $10
            WHERE deployment_id = $1
            "#,
        )
        .bind(deployment.deployment_id)
        .bind(&deployment.resolved_config)
        .bind(deployment.status)
        .bind(deployment.current_step)
        .bind(deployment.total_steps)
        .bind(&deployment.public_url)
        .bind(&deployment.error_message)
        .bind(deployment.rolled_back)
        .bind(deployment.started_at)
        .bind(deployment.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!(
                "deployment {}",
                deployment.deployment_id
            )));
        }
        Ok(())
    }

    async fn list_deploying_deployments(&self) -> EngineResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT deployment_id
            FROM deployments
            WHERE status = 'DEPLOYING'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn create_resource(&self, resource: &DeployedResource) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO deployed_resources (
                resource_id, deployment_id, resource_type, external_id, node_id, name,
                spec, status, health_status, consecutive_health_failures,
                last_health_check_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(resource.resource_id)
        .bind(resource.deployment_id)
        .bind(resource.resource_type)
        .bind(&resource.external_id)
        .bind(resource.node_id)
        .bind(&resource.name)
        .bind(&resource.spec)
        .bind(&resource.status)
        .bind(resource.health_status)
        .bind(resource.consecutive_health_failures)
        .bind(resource.last_health_check_at)
        .bind(resource.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                EngineError::AlreadyExists(format!("resource {}", resource.resource_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_resource(&self, resource_id: Uuid) -> EngineResult<Option<DeployedResource>> {
        let resource = sqlx::query_as::<_, DeployedResource>(
            r#"
            SELECT resource_id, deployment_id, resource_type, external_id, node_id, name,
                   spec, status, health_status, consecutive_health_failures,
                   last_health_check_at, created_at
            FROM deployed_resources
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(resource)
    }

    async fn find_resource_by_execution(
        &self,
        execution_id: Uuid,
    ) -> EngineResult<Option<DeployedResource>> {
        let resource = sqlx::query_as::<_, DeployedResource>(
            r#"
            SELECT resource_id, deployment_id, resource_type, external_id, node_id, name,
                   spec, status, health_status, consecutive_health_failures,
                   last_health_check_at, created_at
            FROM deployed_resources
            WHERE spec->>'execution_id' = $1
            LIMIT 1
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(resource)
    }

    async fn list_health_checkable(&self) -> EngineResult<Vec<DeployedResource>> {
        let resources = sqlx::query_as::<_, DeployedResource>(
            r#"
            SELECT resource_id, deployment_id, resource_type, external_id, node_id, name,
                   spec, status, health_status, consecutive_health_failures,
                   last_health_check_at, created_at
            FROM deployed_resources
            WHERE resource_type = 'CONTAINER'
              AND status = 'running'
              AND external_id != 'pending'
            ORDER BY last_health_check_at ASC NULLS FIRST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(resources)
    }

    async fn attach_deploy_result(
        &self,
        resource_id: Uuid,
        external_id: &str,
        status: &str,
        deployment_result: &serde_json::Value,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployed_resources
            SET external_id = $2,
                status = $3,
                spec = jsonb_set(spec, '{deployment_result}', $4)
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id)
        .bind(external_id)
        .bind(status)
        .bind(deployment_result)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("resource {}", resource_id)));
        }
        Ok(())
    }

    async fn record_health_check(
        &self,
        resource_id: Uuid,
        health: HealthStatus,
        consecutive_failures: i32,
        checked_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE deployed_resources
            SET health_status = $2,
                consecutive_health_failures = $3,
                last_health_check_at = $4
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id)
        .bind(health)
        .bind(consecutive_failures)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_after_restart(&self, resource_id: Uuid) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE deployed_resources
            SET health_status = $2,
                consecutive_health_failures = 0
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id)
        .bind(HealthStatus::Starting)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
