//! Application lifecycle service: template registration, application
//! creation with input validation, and deployment creation with template
//! variable resolution.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::common::{EngineError, EngineResult};

use super::models::{
    Application, ApplicationStatus, ApplicationTemplate, Deployment, DeploymentStatus,
    TemplateInputField,
};
use super::store::DomainStore;

#[derive(Clone)]
pub struct DomainService {
    store: Arc<dyn DomainStore>,
}

impl DomainService {
    pub fn new(store: Arc<dyn DomainStore>) -> Self {
        Self { store }
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    pub async fn register_template(&self, template: ApplicationTemplate) -> EngineResult<()> {
        if template.deployment_steps.is_empty() {
            return Err(EngineError::Validation(format!(
                "template {} has no deployment steps",
                template.template_id
            )));
        }
        self.store.create_template(&template).await
    }

    pub async fn get_template(
        &self,
        template_id: &str,
        version: &str,
    ) -> EngineResult<Option<ApplicationTemplate>> {
        self.store.get_template(template_id, version).await
    }

    // ------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------

    /// Create an application from a template, validating user inputs
    /// against the template's declared fields.
    pub async fn create_application(
        &self,
        tenant_id: Uuid,
        template_id: &str,
        name: &str,
        user_inputs: serde_json::Value,
        description: Option<String>,
    ) -> EngineResult<Application> {
        let template = self
            .store
            .get_latest_template(template_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!("template {} not found", template_id))
            })?;

        validate_inputs(&template.required_inputs, &user_inputs)?;

        let mut application = Application::builder()
            .tenant_id(tenant_id)
            .template_id(template.template_id.clone())
            .template_version(template.version.clone())
            .name(name)
            .user_inputs(user_inputs)
            .build();
        application.description = description;

        self.store.create_application(&application).await?;
        info!(
            application_id = %application.application_id,
            template_id = %template_id,
            "created application"
        );
        Ok(application)
    }

    pub async fn get_application(&self, application_id: Uuid) -> EngineResult<Option<Application>> {
        self.store.get_application(application_id).await
    }

    pub async fn update_application_status(
        &self,
        application_id: Uuid,
        status: ApplicationStatus,
        public_url: Option<String>,
    ) -> EngineResult<()> {
        let mut application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("application {}", application_id)))?;

        application.status = status;
        if public_url.is_some() {
            application.public_url = public_url;
        }
        self.store.update_application(&application).await
    }

    /// Soft delete: the row stays for audit, the status goes DELETED.
    pub async fn delete_application(&self, application_id: Uuid) -> EngineResult<()> {
        let mut application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("application {}", application_id)))?;

        application.status = ApplicationStatus::Deleted;
        application.deleted_at = Some(chrono::Utc::now());
        self.store.update_application(&application).await
    }

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    /// Create a deployment for an application, resolving the template's
    /// `{{variables}}` against the user inputs.
    pub async fn create_deployment(&self, application_id: Uuid) -> EngineResult<Deployment> {
        let mut application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("application {}", application_id)))?;

        let template = self
            .store
            .get_template(&application.template_id, &application.template_version)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "template {} version {} not found",
                    application.template_id, application.template_version
                ))
            })?;

        let resolved_config =
            resolve_config(&template, &application.user_inputs, application.application_id)?;

        let deployment = Deployment::builder()
            .application_id(application.application_id)
            .tenant_id(application.tenant_id)
            .template_id(template.template_id.clone())
            .template_version(template.version.clone())
            .resolved_config(resolved_config)
            .total_steps(template.deployment_steps.len() as i32)
            .build();

        self.store.create_deployment(&deployment).await?;

        application.current_deployment_id = Some(deployment.deployment_id);
        application.status = ApplicationStatus::Creating;
        self.store.update_application(&application).await?;

        info!(
            deployment_id = %deployment.deployment_id,
            application_id = %application_id,
            "created deployment"
        );
        Ok(deployment)
    }

    pub async fn get_deployment(&self, deployment_id: Uuid) -> EngineResult<Option<Deployment>> {
        self.store.get_deployment(deployment_id).await
    }

    pub async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        error_message: Option<String>,
    ) -> EngineResult<()> {
        let mut deployment = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", deployment_id)))?;

        deployment.status = status;
        if error_message.is_some() {
            deployment.error_message = error_message;
        }
        if status == DeploymentStatus::Running {
            deployment.completed_at = Some(chrono::Utc::now());
        }
        self.store.update_deployment(&deployment).await
    }
}

/// Validate user inputs against the template's declared fields.
fn validate_inputs(
    fields: &[TemplateInputField],
    user_inputs: &serde_json::Value,
) -> EngineResult<()> {
    for field in fields {
        let value = user_inputs.get(&field.field_name);

        if field.required && value.is_none() {
            return Err(EngineError::Validation(format!(
                "required field '{}' missing",
                field.field_name
            )));
        }
        let Some(value) = value else {
            continue;
        };

        if field.field_type.as_deref() == Some("integer") && as_integer(value).is_none() {
            return Err(EngineError::Validation(format!(
                "field '{}' must be an integer",
                field.field_name
            )));
        }

        if let Some(pattern) = &field.validation_regex {
            let regex = regex::Regex::new(pattern).map_err(|e| {
                EngineError::Validation(format!(
                    "field '{}' has an invalid validation pattern: {}",
                    field.field_name, e
                ))
            })?;
            let text = value_as_string(value);
            if !regex.is_match(&text) {
                return Err(EngineError::Validation(format!(
                    "field '{}' does not match required format",
                    field.field_name
                )));
            }
        }

        if let (Some(minimum), Some(number)) = (field.min_value, as_integer(value)) {
            if number < minimum {
                return Err(EngineError::Validation(format!(
                    "field '{}' must be >= {}",
                    field.field_name, minimum
                )));
            }
        }
        if let (Some(maximum), Some(number)) = (field.max_value, as_integer(value)) {
            if number > maximum {
                return Err(EngineError::Validation(format!(
                    "field '{}' must be <= {}",
                    field.field_name, maximum
                )));
            }
        }
    }
    Ok(())
}

fn as_integer(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand `{{name}}` placeholders in the template's step list.
///
/// Substitution is a flat string replacement over the serialised form,
/// using the union of the user inputs and the synthetic
/// `application_id` / `application_id_short` variables. Substituting
/// first and parsing back afterwards is part of the contract: typed
/// fields whose value is entirely a placeholder resolve to strings, and
/// unknown placeholders stay literal.
fn resolve_config(
    template: &ApplicationTemplate,
    user_inputs: &serde_json::Value,
    application_id: Uuid,
) -> EngineResult<serde_json::Value> {
    let mut variables: HashMap<String, String> = HashMap::new();
    variables.insert("application_id".to_string(), application_id.to_string());
    variables.insert(
        "application_id_short".to_string(),
        application_id.to_string()[..8].to_string(),
    );
    if let Some(inputs) = user_inputs.as_object() {
        for (key, value) in inputs {
            variables.insert(key.clone(), value_as_string(value));
        }
    }

    let config = json!({ "steps": template.deployment_steps });
    let mut serialised = serde_json::to_string(&config)
        .map_err(|e| EngineError::Validation(format!("template is not serialisable: {}", e)))?;

    for (key, value) in &variables {
        serialised = serialised.replace(&format!("{{{{{}}}}}", key), value);
    }

    serde_json::from_str(&serialised).map_err(|e| {
        EngineError::Validation(format!(
            "resolved config for template {} is not valid JSON: {}",
            template.template_id, e
        ))
    })
}
