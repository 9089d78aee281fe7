// Health monitor process: probes deployed containers and restarts
// persistently unhealthy ones.

use anyhow::{Context, Result};
use engine_core::common::shutdown_token;
use engine_core::health::{HealthMonitor, HealthMonitorConfig};
use engine_core::{Config, EngineKernel};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,engine_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let kernel = EngineKernel::postgres(pool);

    let monitor = HealthMonitor::new(
        kernel.domain,
        kernel.nodes,
        kernel.runtime,
        HealthMonitorConfig {
            check_interval: config.health_interval,
            ..HealthMonitorConfig::default()
        },
    );

    monitor.run(shutdown_token()).await
}
