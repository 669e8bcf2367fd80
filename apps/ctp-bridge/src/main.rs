//! CTP Bridge Binary
//!
//! Starts the engine link, the engine supervisor, the service surface and
//! the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ctp-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BROKER_ID`, `USER_ID`: Account identity (`BROKER_ID/USER_ID`)
//! - `PASSWORD`, `APP_ID`, `AUTH_CODE`: Engine login (read by the engine)
//! - `TRADER_ADDR`, `MARKET_ADDR`: CTP front addresses (read by the engine)
//!
//! ## Optional
//! - `ZMQ_PUSH_URL` / `ZMQ_PULL_URL`: Engine link (default: tcp://0.0.0.0:5701 / tcp://127.0.0.1:5700)
//! - `CTP_VARIANT`: production | openctp (default: production)
//! - `CTP_BRIDGE_HOME`, `CTP_BRIDGE_BINARY`: Engine binary location
//! - `CTP_REQUEST_TIMEOUT_MS`: Per-request timeout (default: 5000)
//! - `QUERY_*`, `ORDER_*`, `MD_*`: Tier limits
//! - `NO_TRADE`: Disable order actions (default: false)
//! - `CTP_BRIDGE_SERVICE_PORT`: Service surface port (default: 8090)
//! - `CTP_BRIDGE_HEALTH_PORT`: Health check HTTP port (default: 8091)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ctp_bridge::infrastructure::health::{HealthServer, HealthServerState};
use ctp_bridge::infrastructure::http::{ServiceServer, ServiceState};
use ctp_bridge::infrastructure::supervisor::reset_session_on_engine_change;
use ctp_bridge::infrastructure::telemetry;
use ctp_bridge::{
    BridgeConfig, Correlator, EngineSupervisor, FrameHub, FrameRouter, Gateway, LivenessProbe,
    OrderActions, SessionTracker, ZmqTransport, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Bound on waiting for the supervisor to reap the engine.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting CTP bridge");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = BridgeConfig::from_env().context("loading configuration")?;
    log_config(&config);

    let account_id = config.account_id();
    let shutdown_token = CancellationToken::new();

    // Engine link; sends wait for the bind
    let (transport, inbound) =
        ZmqTransport::start(config.transport.clone(), shutdown_token.clone());
    let bound = transport
        .ready()
        .await
        .context("binding engine push socket")?;
    tracing::info!(endpoint = %bound, "Engine link bound");
    let peer_accepts = transport.peer_accept_counter();

    // Engine supervisor
    let supervisor = EngineSupervisor::new(config.engine.command(), config.engine.backoff.clone());
    let restart = Arc::new(supervisor.restart_handle());
    let engine_monitor = supervisor.monitor();
    let engine_events = supervisor.subscribe_events();

    // Application services
    let session = Arc::new(SessionTracker::new());
    let correlator = Arc::new(Correlator::new(
        Arc::new(transport),
        restart.clone(),
        config.request_timeout,
    ));
    let hub = Arc::new(FrameHub::new(&account_id, config.broadcast));
    let gateway = Arc::new(Gateway::new(
        config.gateway_config(),
        Arc::clone(&correlator),
        session.subscribe(),
    ));
    let orders = Arc::new(OrderActions::new(
        Arc::clone(&gateway),
        hub.clone(),
        config.request_timeout,
    ));
    let liveness = LivenessProbe::new(Arc::clone(&correlator), config.liveness.clone());

    // Inbound frames
    let router = FrameRouter::new(Arc::clone(&session), Arc::clone(&correlator), hub.clone());
    tokio::spawn(router.run(inbound, shutdown_token.clone()));

    // Every engine process starts a fresh session
    tokio::spawn(reset_session_on_engine_change(
        engine_events,
        Arc::clone(&session),
    ));

    let supervisor_task = tokio::spawn(supervisor.run(shutdown_token.clone()));

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        config.terminal_id.clone(),
        Arc::clone(&gateway),
        engine_monitor,
        hub.clone(),
        peer_accepts,
        liveness,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn service server
    let service_state = Arc::new(ServiceState::new(gateway, orders, hub, restart));
    let service_server = ServiceServer::new(
        config.server.service_port,
        service_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = service_server.run().await {
            tracing::error!(error = %e, "Service server error");
        }
    });

    tracing::info!(terminal_id = %config.terminal_id, "CTP bridge ready");

    await_shutdown(shutdown_token).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, supervisor_task).await {
        Ok(Ok(())) => tracing::info!("Engine stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "Supervisor task failed"),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Supervisor did not stop in time"
        ),
    }

    tracing::info!("CTP bridge stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        account_id = %config.account_id(),
        terminal_id = %config.terminal_id,
        engine = %config.engine.command().program().display(),
        push_endpoint = %config.transport.push_endpoint,
        pull_endpoint = %config.transport.pull_endpoint,
        service_port = config.server.service_port,
        health_port = config.server.health_port,
        no_trade = config.no_trade,
        "Configuration loaded"
    );
    tracing::debug!(
        query = ?config.tiers.query,
        order = ?config.tiers.order,
        market_data = ?config.tiers.market_data,
        request_timeout_ms = config.request_timeout.as_millis(),
        "Tier limits"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGINT, SIGTERM, SIGHUP or SIGQUIT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect("SIGHUP handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let quit = async {
        signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("SIGQUIT handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();
    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = hangup => {
            tracing::info!("Received SIGHUP, initiating shutdown");
        }
        () = quit => {
            tracing::info!("Received SIGQUIT, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
