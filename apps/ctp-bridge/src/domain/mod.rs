//! Domain Layer - Core bridge types with no I/O.
//!
//! This layer contains the wire frame model, the engine return-code
//! taxonomy, session state and service-tier routing. All types here are
//! pure Rust with serialization support.

/// Wire frames exchanged with the native engine and return-code classification.
pub mod frame;

/// Login / settlement session state.
pub mod session;

/// Service tiers and method-name routing.
pub mod tier;
