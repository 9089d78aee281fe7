//! Domain models for applications, templates, deployments, and deployed
//! resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "application_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Creating,
    Running,
    Stopped,
    Failed,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "deployment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Failed,
    RolledBack,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "resource_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Container,
    Database,
    Volume,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "health_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Starting,
}

/// Liveness probe definition carried in a container step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// `http`, `tcp`, or `command`.
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_probe_interval")]
    pub interval_seconds: u32,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
    #[serde(default)]
    pub initial_delay_seconds: u32,
}

fn default_probe_interval() -> u32 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_probe_retries() -> u32 {
    3
}

/// One step of a template's deployment plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub step_id: String,
    pub step_name: String,
    /// `container`, `volume`, or `database`.
    pub step_type: String,
    pub order: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub spec_template: serde_json::Value,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Declared user input of a template, validated at application creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInputField {
    pub field_name: String,
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub validation_regex: Option<String>,
    #[serde(default)]
    pub min_value: Option<i64>,
    #[serde(default)]
    pub max_value: Option<i64>,
}

/// A versioned, resolved template document. How templates get authored is
/// out of scope; the core only consumes them.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ApplicationTemplate {
    pub template_id: String,
    pub version: String,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    #[builder(default, setter(strip_option))]
    pub category: Option<String>,
    #[sqlx(json)]
    pub deployment_steps: Vec<DeploymentStep>,
    #[builder(default)]
    #[sqlx(json)]
    pub required_inputs: Vec<TemplateInputField>,
    #[builder(default = true)]
    pub active: bool,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

/// User-facing handle over the latest deployment.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Application {
    #[builder(default = Uuid::new_v4())]
    pub application_id: Uuid,
    pub tenant_id: Uuid,
    pub template_id: String,
    pub template_version: String,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    #[builder(default = serde_json::json!({}))]
    pub user_inputs: serde_json::Value,
    #[builder(default = ApplicationStatus::Creating)]
    pub status: ApplicationStatus,
    #[builder(default, setter(strip_option))]
    pub current_deployment_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub public_url: Option<String>,
    #[builder(default = HealthStatus::Unknown)]
    pub health_status: HealthStatus,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A single attempt to realise an application from a template.
///
/// Status is a materialised view over the child executions, maintained by
/// the status updater: RUNNING iff every child completed, FAILED once any
/// child failed terminally.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Deployment {
    #[builder(default = Uuid::new_v4())]
    pub deployment_id: Uuid,
    pub application_id: Uuid,
    pub tenant_id: Uuid,
    pub template_id: String,
    pub template_version: String,
    /// Template document with `{{variables}}` expanded against user inputs.
    #[builder(default = serde_json::json!({}))]
    pub resolved_config: serde_json::Value,
    #[builder(default = DeploymentStatus::Pending)]
    pub status: DeploymentStatus,
    #[builder(default = 0)]
    pub current_step: i32,
    #[builder(default = 0)]
    pub total_steps: i32,
    #[builder(default, setter(strip_option))]
    pub public_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default = false)]
    pub rolled_back: bool,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

/// What actually got materialised on a node.
///
/// The row is created before its execution completes (`external_id`
/// "pending") and updated with the agent-assigned id afterwards; the
/// resource id is stable across retries.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct DeployedResource {
    #[builder(default = Uuid::new_v4())]
    pub resource_id: Uuid,
    pub deployment_id: Uuid,
    #[builder(default = ResourceType::Container)]
    pub resource_type: ResourceType,
    #[builder(default = "pending".to_string())]
    pub external_id: String,
    pub node_id: Uuid,
    pub name: String,
    /// Step snapshot plus `execution_id`, the probe definition, and - once
    /// deployed - the agent's `deployment_result`.
    #[builder(default = serde_json::json!({}))]
    pub spec: serde_json::Value,
    #[builder(default = "pending".to_string())]
    pub status: String,
    #[builder(default = HealthStatus::Unknown)]
    pub health_status: HealthStatus,
    #[builder(default = 0)]
    pub consecutive_health_failures: i32,
    #[builder(default, setter(strip_option))]
    pub last_health_check_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl DeployedResource {
    /// Probe definition, if the step declared one.
    pub fn health_check(&self) -> Option<HealthCheckSpec> {
        let raw = self.spec.get("health_check")?;
        if raw.is_null() {
            return None;
        }
        serde_json::from_value(raw.clone()).ok()
    }

    /// The execution that deploys (or deployed) this resource.
    pub fn execution_id(&self) -> Option<Uuid> {
        self.spec
            .get("execution_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    /// Resolve the host port mapped to `internal_port` from the agent's
    /// deployment result. Keys have the form `"<n>/tcp"`.
    pub fn host_port(&self, internal_port: u16) -> Option<u16> {
        let ports = self.spec.get("deployment_result")?.get("ports")?;
        let mapped = ports
            .get(format!("{}/tcp", internal_port))
            .or_else(|| ports.get(internal_port.to_string()))?;
        mapped.as_u64().map(|p| p as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn probe_spec_defaults_are_applied() {
        let probe: HealthCheckSpec =
            serde_json::from_value(json!({"type": "http", "path": "/", "port": 80})).unwrap();
        assert_eq!(probe.interval_seconds, 10);
        assert_eq!(probe.timeout_seconds, 5);
        assert_eq!(probe.retries, 3);
        assert_eq!(probe.initial_delay_seconds, 0);
    }

    #[test]
    fn resource_without_probe_has_no_health_check() {
        let resource = DeployedResource::builder()
            .deployment_id(Uuid::new_v4())
            .node_id(Uuid::new_v4())
            .name("web")
            .spec(json!({"health_check": null}))
            .build();
        assert!(resource.health_check().is_none());
    }

    #[test]
    fn host_port_resolves_protocol_suffixed_keys() {
        let resource = DeployedResource::builder()
            .deployment_id(Uuid::new_v4())
            .node_id(Uuid::new_v4())
            .name("web")
            .spec(json!({"deployment_result": {"ports": {"80/tcp": 8080}}}))
            .build();
        assert_eq!(resource.host_port(80), Some(8080));
        assert_eq!(resource.host_port(443), None);
    }

    #[test]
    fn execution_id_round_trips_through_spec() {
        let execution_id = Uuid::new_v4();
        let resource = DeployedResource::builder()
            .deployment_id(Uuid::new_v4())
            .node_id(Uuid::new_v4())
            .name("web")
            .spec(json!({"execution_id": execution_id.to_string()}))
            .build();
        assert_eq!(resource.execution_id(), Some(execution_id));
    }
}
