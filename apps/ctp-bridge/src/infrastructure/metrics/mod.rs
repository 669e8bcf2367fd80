//! Prometheus Metrics Module
//!
//! Exposes bridge metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames by kind, dropped messages by reason
//! - **Requests**: Gateway calls by tier and outcome, call latency
//! - **Admission**: In-flight and waiting callers per tier, backlog rejections
//! - **Engine**: Restart signals by reason, engine restarts, session state
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::RestartReason;
use crate::domain::tier::ServiceTier;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frames
    describe_counter!(
        "ctp_bridge_frames_received_total",
        "Total frames received from the engine by kind"
    );
    describe_counter!(
        "ctp_bridge_frames_dropped_total",
        "Total inbound messages dropped by reason"
    );

    // Requests
    describe_counter!(
        "ctp_bridge_requests_total",
        "Total gateway calls by tier and outcome"
    );
    describe_histogram!(
        "ctp_bridge_request_duration_seconds",
        "Gateway call latency from admission to terminal frame"
    );

    // Admission
    describe_gauge!(
        "ctp_bridge_tier_in_flight",
        "Calls currently holding a tier concurrency slot"
    );
    describe_gauge!(
        "ctp_bridge_tier_backlog",
        "Callers waiting for tier admission"
    );
    describe_counter!(
        "ctp_bridge_admission_rejections_total",
        "Calls rejected because the tier backlog was full"
    );

    // Engine
    describe_counter!(
        "ctp_bridge_restart_signals_total",
        "Engine restart signals by reason"
    );
    describe_counter!(
        "ctp_bridge_engine_restarts_total",
        "Engine processes spawned after the first"
    );
    describe_gauge!(
        "ctp_bridge_session_state",
        "Session state (0 not connected, 1 logged in, 2 settlement confirmed)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for inbound frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Response correlated to a request id.
    Response,
    /// Unsolicited engine event (`request_id = 0`).
    Unsolicited,
    /// Request frame echoed back (not expected from the engine).
    Request,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::Unsolicited => "unsolicited",
            Self::Request => "request",
        }
    }
}

/// Record a frame received from the engine.
pub fn record_frame_received(kind: FrameKind) {
    counter!("ctp_bridge_frames_received_total", "kind" => kind.as_str()).increment(1);
}

/// Record an inbound message that was dropped.
pub fn record_frame_dropped(reason: &'static str) {
    counter!("ctp_bridge_frames_dropped_total", "reason" => reason).increment(1);
}

/// Record a completed gateway call.
pub fn record_request(tier: ServiceTier, outcome: &'static str, duration: Duration) {
    counter!(
        "ctp_bridge_requests_total",
        "tier" => tier.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "ctp_bridge_request_duration_seconds",
        "tier" => tier.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Update the in-flight gauge for a tier.
#[allow(clippy::cast_precision_loss)]
pub fn set_tier_in_flight(tier: ServiceTier, count: usize) {
    gauge!("ctp_bridge_tier_in_flight", "tier" => tier.as_str()).set(count as f64);
}

/// Update the backlog gauge for a tier.
#[allow(clippy::cast_precision_loss)]
pub fn set_tier_backlog(tier: ServiceTier, count: usize) {
    gauge!("ctp_bridge_tier_backlog", "tier" => tier.as_str()).set(count as f64);
}

/// Record a backlog-overflow rejection.
pub fn record_admission_rejection(tier: ServiceTier) {
    counter!(
        "ctp_bridge_admission_rejections_total",
        "tier" => tier.as_str()
    )
    .increment(1);
}

/// Record a restart signal.
pub fn record_restart_signal(reason: RestartReason) {
    counter!(
        "ctp_bridge_restart_signals_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record an engine restart.
pub fn record_engine_restart() {
    counter!("ctp_bridge_engine_restarts_total").increment(1);
}

/// Update the session state gauge.
pub fn set_session_state(level: u8) {
    gauge!("ctp_bridge_session_state").set(f64::from(level));
}

// =============================================================================
// Tests
// =============================================================================
