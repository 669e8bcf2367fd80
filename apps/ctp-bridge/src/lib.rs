#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! CTP Bridge - Rate-Limited Gateway for the native CTP engine
//!
//! Front-ends a native CTP trading engine that speaks JSON frames over
//! ZeroMQ push/pull sockets. The bridge correlates multi-frame replies,
//! gates traffic behind login and settlement confirmation, throttles three
//! service tiers and keeps the engine process alive.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types
//!   - `frame`: Wire frames and engine return codes
//!   - `session`: Login / settlement session state
//!   - `tier`: Service tiers and method routing
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, restart signal and frame feed interfaces
//!   - `services`: Correlation, session tracking, admission, gateway,
//!     order actions, liveness, frame routing
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `transport`: ZeroMQ and in-memory transports
//!   - `supervisor`: Engine process supervision with backoff
//!   - `broadcast`: Inbound frame fan-out (`CTP/ZMQ` channel)
//!   - `http`: Service surface
//!   - `config`: Environment configuration
//!   - `health`: Health, readiness and liveness endpoints
//!
//! # Data Flow
//!
//! ```text
//!  callers ──► Gateway ──► TierAdmission ──► Correlator ──► push socket ──► engine
//!                                               ▲
//!  engine ──► pull socket ──► FrameRouter ──────┤
//!                                 │             └─► SessionTracker
//!                                 └──► FrameHub ──► observers (SSE, order actions)
//!
//!  Correlator ── -1 / -2 ──► RestartHandle ──► EngineSupervisor
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Frames, session state and tiers with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::frame::{Frame, FrameError, RequestBody, ResponseBody, ReturnCode};
pub use domain::session::{LoginSnapshot, Readiness, SessionState, SettlementSnapshot};
pub use domain::tier::ServiceTier;

// Application services
pub use application::ports::{FrameTransport, RestartReason, RestartSignal, TransportError};
pub use application::services::{
    CorrelationError, Correlator, Fault, FaultKind, FrameRouter, Gateway, GatewayConfig,
    GatewayError, LivenessConfig, LivenessProbe, OrderActions, OrderOutcome, ReplyStream,
    SessionTracker, TierLimits,
};

// Infrastructure config
pub use infrastructure::config::{BridgeConfig, ConfigError, EngineCredentials};

// Health and service servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::http::{ServiceServer, ServiceServerError, ServiceState};

// Broadcast hub (for integration tests)
pub use infrastructure::broadcast::{BroadcastConfig, BroadcastStats, FrameHub, SharedFrameHub};

// Transports
pub use infrastructure::transport::{ChannelTransport, EnginePeer, ZmqConfig, ZmqTransport};

// Supervisor
pub use infrastructure::supervisor::{
    EngineEvent, EngineMonitor, EngineState, EngineSupervisor, RestartHandle, SupervisorError,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
