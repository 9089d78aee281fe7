use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use uuid::Uuid;

/// Process configuration loaded from environment variables.
///
/// Every reconciler binary shares this: the executor reads the worker
/// settings, the others only their own interval.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub max_slots: usize,
    pub lease_seconds: i64,
    pub status_interval: Duration,
    pub retry_interval: Duration,
    pub health_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` if
    /// present (development).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_id: env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("executor-{}", Uuid::new_v4())),
            poll_interval: seconds_var("POLL_INTERVAL", 2.0)?,
            max_slots: env::var("MAX_SLOTS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("MAX_SLOTS must be a valid number")?,
            lease_seconds: env::var("LEASE_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("LEASE_SECONDS must be a valid number")?,
            status_interval: seconds_var("STATUS_POLL_INTERVAL", 5.0)?,
            retry_interval: seconds_var("RETRY_POLL_INTERVAL", 5.0)?,
            health_interval: seconds_var("HEALTH_CHECK_INTERVAL", 10.0)?,
        })
    }
}

fn seconds_var(name: &str, default: f64) -> Result<Duration> {
    let seconds: f64 = match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a number of seconds", name))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs_f64(seconds))
}
