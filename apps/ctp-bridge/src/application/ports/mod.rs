//! Port Interfaces
//!
//! Defines the interfaces (ports) the application services depend on.
//! Infrastructure adapters implement them.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FrameTransport`: Sends frames to the native engine
//! - `RestartSignal`: Asks the process supervisor for an engine restart
//! - `FrameFeed`: Republishes inbound frames to observers

mod feed_port;
mod restart_port;
mod transport_port;

pub use feed_port::{FrameBroadcast, FrameFeed};
pub use restart_port::{RestartReason, RestartSignal};
pub use transport_port::{FrameTransport, TransportError};
