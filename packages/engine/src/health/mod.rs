//! Health monitor: probes deployed containers and restarts the ones that
//! stay unhealthy.
//!
//! Probes come from the step's health check definition: `http` (2xx/3xx on
//! the mapped host port), `tcp` (connect), or `command` (exec via the
//! node's agent, exit 0). Three consecutive failures mark the resource
//! UNHEALTHY and schedule a restart after a damping delay so a flapping
//! container does not enter a restart loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::EngineResult;
use crate::domain::{DeployedResource, DomainStore, HealthCheckSpec, HealthStatus};
use crate::executor::ContainerRuntime;
use crate::nodes::NodeStore;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    /// Consecutive failures before a resource is marked UNHEALTHY.
    pub failure_threshold: i32,
    /// Wait before restarting an unhealthy container.
    pub restart_delay: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            failure_threshold: 3,
            restart_delay: Duration::from_secs(60),
        }
    }
}

struct Inner {
    domain: Arc<dyn DomainStore>,
    nodes: Arc<dyn NodeStore>,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    config: HealthMonitorConfig,
}

/// Cheap handle over the monitor's shared state; restart tasks carry a
/// clone.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(
        domain: Arc<dyn DomainStore>,
        nodes: Arc<dyn NodeStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                domain,
                nodes,
                runtime,
                http: reqwest::Client::new(),
                config,
            }),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let config = &self.inner.config;
        info!(
            check_interval_ms = config.check_interval.as_millis() as u64,
            failure_threshold = config.failure_threshold,
            restart_delay_ms = config.restart_delay.as_millis() as u64,
            "health monitor starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "error in health check cycle");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.check_interval) => {}
            }
        }

        info!("health monitor stopped");
        Ok(())
    }

    /// One probe pass over every running container, stalest check first.
    pub async fn run_cycle(&self) -> EngineResult<()> {
        let resources = self.inner.domain.list_health_checkable().await?;
        if resources.is_empty() {
            debug!("no containers to check");
            return Ok(());
        }

        for resource in resources {
            let resource_id = resource.resource_id;
            if let Err(e) = self.check_resource(resource).await {
                error!(resource_id = %resource_id, error = %e, "health check errored");
            }
        }
        Ok(())
    }

    async fn check_resource(&self, resource: DeployedResource) -> EngineResult<()> {
        let healthy = match resource.health_check() {
            // No probe configured: assume healthy.
            None => true,
            Some(probe) => match probe.check_type.as_str() {
                "http" => self.check_http(&resource, &probe).await,
                "tcp" => self.check_tcp(&resource, &probe).await,
                "command" => self.check_command(&resource, &probe).await,
                other => {
                    warn!(resource_id = %resource.resource_id, probe = %other, "unknown probe type");
                    true
                }
            },
        };

        if healthy {
            self.inner
                .domain
                .record_health_check(resource.resource_id, HealthStatus::Healthy, 0, Utc::now())
                .await?;
            return Ok(());
        }

        let failures = resource.consecutive_health_failures + 1;
        let status = if failures >= self.inner.config.failure_threshold {
            HealthStatus::Unhealthy
        } else {
            // Still tracking; the threshold has not tripped yet.
            HealthStatus::Healthy
        };
        self.inner
            .domain
            .record_health_check(resource.resource_id, status, failures, Utc::now())
            .await?;

        // Restart exactly once, at the moment the threshold trips.
        if failures == self.inner.config.failure_threshold {
            warn!(
                resource_id = %resource.resource_id,
                failures,
                "container unhealthy, scheduling restart"
            );
            self.schedule_restart(resource).await;
        }

        Ok(())
    }

    async fn check_http(&self, resource: &DeployedResource, probe: &HealthCheckSpec) -> bool {
        let internal_port = probe.port.unwrap_or(80);
        let Some(host_port) = resource.host_port(internal_port) else {
            warn!(
                resource_id = %resource.resource_id,
                port = internal_port,
                "probe port not found in port mappings"
            );
            return false;
        };

        let path = probe.path.as_deref().unwrap_or("/");
        let url = format!("http://localhost:{}{}", host_port, path);

        match self
            .inner
            .http
            .get(&url)
            .timeout(Duration::from_secs(probe.timeout_seconds))
            .send()
            .await
        {
            Ok(response) => {
                let healthy = response.status().is_success() || response.status().is_redirection();
                if healthy {
                    debug!(resource_id = %resource.resource_id, url = %url, "http probe ok");
                } else {
                    warn!(
                        resource_id = %resource.resource_id,
                        url = %url,
                        status = response.status().as_u16(),
                        "http probe failed"
                    );
                }
                healthy
            }
            Err(e) => {
                warn!(resource_id = %resource.resource_id, url = %url, error = %e, "http probe errored");
                false
            }
        }
    }

    async fn check_tcp(&self, resource: &DeployedResource, probe: &HealthCheckSpec) -> bool {
        let internal_port = probe.port.unwrap_or(80);
        let Some(host_port) = resource.host_port(internal_port) else {
            warn!(
                resource_id = %resource.resource_id,
                port = internal_port,
                "probe port not found in port mappings"
            );
            return false;
        };

        let connect = tokio::net::TcpStream::connect(("127.0.0.1", host_port));
        match tokio::time::timeout(Duration::from_secs(probe.timeout_seconds), connect).await {
            Ok(Ok(_)) => {
                debug!(resource_id = %resource.resource_id, port = host_port, "tcp probe ok");
                true
            }
            _ => {
                warn!(resource_id = %resource.resource_id, port = host_port, "tcp probe failed");
                false
            }
        }
    }

    async fn check_command(&self, resource: &DeployedResource, probe: &HealthCheckSpec) -> bool {
        let Some(command) = probe.command.as_deref() else {
            warn!(resource_id = %resource.resource_id, "command probe without a command");
            return false;
        };
        let Some(agent_url) = self.agent_url_for(resource).await else {
            return false;
        };

        match self
            .inner
            .runtime
            .exec(&agent_url, &resource.external_id, command)
            .await
        {
            Ok(result) => result.exit_code == 0,
            Err(e) => {
                warn!(resource_id = %resource.resource_id, error = %e, "command probe errored");
                false
            }
        }
    }

    /// Wait out the damping delay, then restart via the node's agent. Runs
    /// detached so one flapping container cannot stall the probe loop.
    async fn schedule_restart(&self, resource: DeployedResource) {
        let Some(agent_url) = self.agent_url_for(&resource).await else {
            return;
        };

        let monitor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(monitor.inner.config.restart_delay).await;

            info!(
                resource_id = %resource.resource_id,
                container_id = %resource.external_id,
                "restarting container"
            );
            match monitor
                .inner
                .runtime
                .restart_container(&agent_url, &resource.external_id)
                .await
            {
                Ok(()) => {
                    if let Err(e) = monitor
                        .inner
                        .domain
                        .reset_after_restart(resource.resource_id)
                        .await
                    {
                        error!(resource_id = %resource.resource_id, error = %e, "failed to reset health after restart");
                    }
                }
                Err(e) => {
                    error!(resource_id = %resource.resource_id, error = %e, "failed to restart container");
                }
            }
        });
    }

    async fn agent_url_for(&self, resource: &DeployedResource) -> Option<String> {
        match self.inner.nodes.get(resource.node_id).await {
            Ok(Some(node)) => Some(node.runtime_agent_url),
            Ok(None) => {
                warn!(resource_id = %resource.resource_id, node_id = %resource.node_id, "node not found for resource");
                None
            }
            Err(e) => {
                error!(resource_id = %resource.resource_id, error = %e, "failed to load node for resource");
                None
            }
        }
    }
}
