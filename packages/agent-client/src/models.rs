//! Request and response types for the runtime agent wire contract.
//!
//! The agent may add fields at any time, so every response type must
//! deserialize with unknown fields present and sensible defaults for
//! fields an older agent does not send.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Body of `POST /deploy`.
#[derive(Debug, Serialize)]
pub struct DeployRequest {
    pub execution_id: String,
    pub container_spec: serde_json::Value,
}

/// Successful response of `POST /deploy`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployResult {
    pub container_id: String,
    pub container_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub internal_ip: Option<String>,
    /// Port mappings keyed `"<container-port>/tcp"` -> host port.
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentHealth {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub docker_connected: bool,
}

/// Response of `GET /info`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub containers_running: i64,
    #[serde(default)]
    pub containers_total: i64,
    #[serde(default)]
    pub images_count: i64,
    #[serde(default)]
    pub memory_total: i64,
    #[serde(default)]
    pub cpu_count: i64,
}

/// Response of `GET /containers/{id}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStatus {
    pub container_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

/// Body of `POST /containers/{id}/exec`.
#[derive(Debug, Serialize)]
pub struct ExecRequest {
    pub command: String,
}

/// Response of `POST /containers/{id}/exec`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}
