//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the bridge talks to the engine link and the supervisor.

/// Port interfaces for the engine transport and restart signalling.
pub mod ports;

/// Correlation, session tracking, admission control and the gateway.
pub mod services;
