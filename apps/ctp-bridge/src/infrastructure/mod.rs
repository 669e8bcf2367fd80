//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Frame transports: ZeroMQ push/pull and in-memory channels.
pub mod transport;

/// Native engine process supervision.
pub mod supervisor;

/// Broadcast channel for inbound frames.
pub mod broadcast;

/// HTTP service surface.
pub mod http;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
