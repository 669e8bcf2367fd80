//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, engine status reporting, and Prometheus metrics.
//! Used by container orchestrators, the `ctp-liveness` probe and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Process liveness (simple OK)
//! - `GET /readyz` - Ready once settlement is confirmed
//! - `GET /livez` - Pings the engine through the correlator
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{Gateway, LivenessProbe, TierStats};
use crate::domain::session::{Readiness, SessionState};
use crate::infrastructure::broadcast::{BroadcastStats, SharedFrameHub};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::supervisor::{EngineMonitor, EngineState};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Bridge version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Terminal identity.
    pub terminal_id: String,
    /// Engine process status.
    pub engine: EngineStatus,
    /// Session state label.
    pub session: &'static str,
    /// Requests awaiting a terminal frame.
    pub in_flight_requests: usize,
    /// Per-tier admission statistics.
    pub tiers: Vec<TierStats>,
    /// Frame channel statistics.
    pub broadcast: BroadcastStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Settlement confirmed; every tier is usable.
    Healthy,
    /// Engine is running but the session is not confirmed yet.
    Degraded,
    /// No engine process.
    Unhealthy,
}

/// Engine process status.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Supervisor state.
    #[serde(flatten)]
    pub state: EngineState,
    /// Completed restart cycles.
    pub restarts: u64,
    /// Restart signals received.
    pub restart_signals: u64,
    /// Engine connections to the push socket.
    pub peer_accepts: u64,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    terminal_id: String,
    started_at: Instant,
    gateway: Arc<Gateway>,
    engine: EngineMonitor,
    hub: SharedFrameHub,
    peer_accepts: Arc<AtomicU64>,
    liveness: LivenessProbe,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        terminal_id: String,
        gateway: Arc<Gateway>,
        engine: EngineMonitor,
        hub: SharedFrameHub,
        peer_accepts: Arc<AtomicU64>,
        liveness: LivenessProbe,
    ) -> Self {
        Self {
            version,
            terminal_id,
            started_at: Instant::now(),
            gateway,
            engine,
            hub,
            peer_accepts,
            liveness,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Health routes.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(process_liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/livez", get(engine_liveness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn process_liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.gateway.is_ready(Readiness::SettlementConfirmed) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn engine_liveness_handler(
    State(state): State<Arc<HealthServerState>>,
) -> impl IntoResponse {
    match state.liveness.check().await {
        Ok(report) => (StatusCode::OK, Json(json!({ "alive": true, "report": report }))),
        Err(e) => {
            tracing::warn!(error = %e, "Engine liveness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "alive": false, "error": e.to_string() })),
            )
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let engine_state = state.engine.state();
    let session = state.gateway.session();
    let status = determine_health_status(&engine_state, &session);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        terminal_id: state.terminal_id.clone(),
        engine: EngineStatus {
            state: engine_state,
            restarts: state.engine.restart_count(),
            restart_signals: state.engine.signal_count(),
            peer_accepts: state.peer_accepts.load(Ordering::Relaxed),
        },
        session: session.as_str(),
        in_flight_requests: state.gateway.correlator().in_flight(),
        tiers: state.gateway.tier_stats(),
        broadcast: state.hub.stats(),
    }
}

fn determine_health_status(engine: &EngineState, session: &SessionState) -> HealthStatus {
    if session.satisfies(Readiness::SettlementConfirmed) {
        HealthStatus::Healthy
    } else if engine.is_running() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Value;

    use super::*;
    use crate::domain::session::{LoginSnapshot, SettlementSnapshot};

    fn login() -> LoginSnapshot {
        LoginSnapshot::from_value(&json!({
            "BrokerID": "9999",
            "UserID": "1001",
            "FrontID": 1,
            "SessionID": 2
        }))
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn confirmed_session_is_healthy() {
        let session = SessionState::SettlementConfirmed {
            login: login(),
            settlement: SettlementSnapshot {
                raw: Value::Null,
                observed_at: Utc::now(),
            },
        };
        let status = determine_health_status(&EngineState::Running { pid: 42 }, &session);
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn running_engine_without_settlement_is_degraded() {
        let status = determine_health_status(
            &EngineState::Running { pid: 42 },
            &SessionState::LoggedIn(login()),
        );
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn no_engine_is_unhealthy() {
        let status = determine_health_status(
            &EngineState::CrashedAwaitingRestart {
                attempt: 2,
                backoff_ms: 4_000,
            },
            &SessionState::NotConnected,
        );
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[test]
    fn engine_status_flattens_state() {
        let status = EngineStatus {
            state: EngineState::Running { pid: 7 },
            restarts: 1,
            restart_signals: 3,
            peer_accepts: 2,
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["state"], "running");
        assert_eq!(value["pid"], 7);
        assert_eq!(value["restart_signals"], 3);
    }
}
