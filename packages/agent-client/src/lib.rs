//! HTTP client for the runtime agent co-located with each container runtime.
//!
//! The agent is the platform's only dependency for actually running
//! containers. Every call carries its own timeout; connection failures and
//! 5xx responses surface as [`AgentError::Transient`] so callers can feed
//! them into backoff-retry, while 4xx responses are [`AgentError::Permanent`]
//! and must not be retried.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

pub mod models;

pub use models::{AgentHealth, ContainerStatus, DeployResult, ExecResult, NodeInfo};

use models::{DeployRequest, ExecRequest};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const INFO_TIMEOUT: Duration = Duration::from_secs(10);
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_TIMEOUT: Duration = Duration::from_secs(5);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the runtime agent, pre-classified for retry decisions.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Network failure, timeout, or agent-side 5xx. Eligible for retry.
    #[error("{0}")]
    Transient(String),
    /// Agent rejected the request (4xx). Never retried.
    #[error("{0}")]
    Permanent(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }
}

/// Client for a single runtime agent endpoint.
#[derive(Debug, Clone)]
pub struct AgentClient {
    base_url: String,
    client: Client,
}

impl AgentClient {
    /// Create a client for the agent at `agent_url` (e.g. `http://10.0.1.10:9000`).
    pub fn new(agent_url: &str) -> Self {
        Self {
            base_url: agent_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health` - returns false on any failure rather than erroring,
    /// callers treat an unreachable agent the same as an unhealthy one.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// `GET /info`
    pub async fn get_node_info(&self) -> Result<NodeInfo, AgentError> {
        let url = format!("{}/info", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(INFO_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse_response(response).await
    }

    /// `POST /deploy`
    pub async fn deploy_container(
        &self,
        execution_id: Uuid,
        container_spec: &serde_json::Value,
    ) -> Result<DeployResult, AgentError> {
        let url = format!("{}/deploy", self.base_url);
        let request = DeployRequest {
            execution_id: execution_id.to_string(),
            container_spec: container_spec.clone(),
        };
        let response = self
            .client
            .post(&url)
            .timeout(DEPLOY_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse_response(response).await
    }

    /// `GET /containers/{id}/status`
    pub async fn get_container_status(
        &self,
        container_id: &str,
    ) -> Result<ContainerStatus, AgentError> {
        let url = format!("{}/containers/{}/status", self.base_url, container_id);
        let response = self
            .client
            .get(&url)
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse_response(response).await
    }

    /// `POST /containers/{id}/stop`
    pub async fn stop_container(&self, container_id: &str) -> Result<(), AgentError> {
        let url = format!("{}/containers/{}/stop", self.base_url, container_id);
        let response = self
            .client
            .post(&url)
            .timeout(STOP_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response).await
    }

    /// `POST /containers/{id}/restart`
    pub async fn restart_container(&self, container_id: &str) -> Result<(), AgentError> {
        let url = format!("{}/containers/{}/restart", self.base_url, container_id);
        let response = self
            .client
            .post(&url)
            .timeout(RESTART_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response).await
    }

    /// `POST /containers/{id}/exec`
    pub async fn exec(
        &self,
        container_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, AgentError> {
        let url = format!("{}/containers/{}/exec", self.base_url, container_id);
        let response = self
            .client
            .post(&url)
            .timeout(timeout.unwrap_or(EXEC_TIMEOUT))
            .json(&ExecRequest {
                command: command.to_string(),
            })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse_response(response).await
    }

    /// `DELETE /containers/{id}?force=bool`
    pub async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
    ) -> Result<(), AgentError> {
        let url = format!(
            "{}/containers/{}?force={}",
            self.base_url, container_id, force
        );
        let response = self
            .client
            .delete(&url)
            .timeout(REMOVE_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response).await
    }

    fn transport_error(&self, error: reqwest::Error) -> AgentError {
        if error.is_timeout() {
            AgentError::Transient(format!(
                "request to runtime agent at {} timed out",
                self.base_url
            ))
        } else if error.is_connect() {
            AgentError::Transient(format!(
                "cannot connect to runtime agent at {}: connection refused or unreachable",
                self.base_url
            ))
        } else {
            AgentError::Transient(format!(
                "request to runtime agent at {} failed: {}",
                self.base_url, error
            ))
        }
    }

    fn classify_status(&self, status: StatusCode, body: String) -> AgentError {
        if status.is_client_error() {
            AgentError::Permanent(format!(
                "runtime agent at {} rejected request: status {} - {}",
                self.base_url,
                status.as_u16(),
                body
            ))
        } else {
            AgentError::Transient(format!(
                "runtime agent at {} returned status {}: {}",
                self.base_url,
                status.as_u16(),
                body
            ))
        }
    }

    async fn parse_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, AgentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }
        response.json::<T>().await.map_err(|e| {
            AgentError::Permanent(format!(
                "failed to parse runtime agent response: {}",
                e
            ))
        })
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<(), AgentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }
        Ok(())
    }
}
