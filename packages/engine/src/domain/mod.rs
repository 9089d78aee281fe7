//! Application lifecycle domain: templates, applications, deployments, and
//! the resources they materialise.

mod models;
mod postgres;
mod service;
mod store;

pub use models::{
    Application, ApplicationStatus, ApplicationTemplate, DeployedResource, Deployment,
    DeploymentStatus, DeploymentStep, HealthCheckSpec, HealthStatus, ResourceType,
    TemplateInputField,
};
pub use postgres::PostgresDomainStore;
pub use service::DomainService;
pub use store::DomainStore;
