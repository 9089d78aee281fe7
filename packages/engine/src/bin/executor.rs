// Executor worker process: claims queued executions and runs them.

use anyhow::{Context, Result};
use engine_core::common::shutdown_token;
use engine_core::executor::{Executor, ExecutorConfig};
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
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let kernel = EngineKernel::postgres(pool);

    let executor = Executor::new(
        kernel.executions,
        kernel.domain,
        kernel.runtime,
        ExecutorConfig {
            worker_id: config.worker_id,
            poll_interval: config.poll_interval,
            max_slots: config.max_slots,
            lease_seconds: config.lease_seconds,
        },
    );

    executor.run(shutdown_token()).await
}
