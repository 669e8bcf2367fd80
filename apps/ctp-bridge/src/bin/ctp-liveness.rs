//! Standalone engine liveness probe.
//!
//! Asks a running bridge to ping the engine through its correlator and
//! exits 0 when the engine answered, 1 otherwise. Suitable as a container
//! health command.
//!
//! # Environment Variables
//!
//! - `CTP_BRIDGE_HEALTH_PORT`: Bridge health port (default: 8091)
//! - `CTP_LIVENESS_TIMEOUT_SECS`: Overall HTTP timeout (default: 15)

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;

const DEFAULT_HEALTH_PORT: u16 = 8091;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let port = env_or("CTP_BRIDGE_HEALTH_PORT", DEFAULT_HEALTH_PORT);
    let timeout = env_or("CTP_LIVENESS_TIMEOUT_SECS", DEFAULT_TIMEOUT.as_secs());
    let url = format!("http://127.0.0.1:{port}/livez");

    match probe(&url, Duration::from_secs(timeout)).await {
        Ok(body) => {
            tracing::info!(%url, %body, "Engine alive");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(%url, error = %e, "Engine liveness check failed");
            ExitCode::FAILURE
        }
    }
}

async fn probe(url: &str, timeout: Duration) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("requesting liveness")?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        bail!("{status}: {body}");
    }
    Ok(body)
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
