//! Frame Transports
//!
//! Adapters implementing [`FrameTransport`](crate::application::ports::FrameTransport):
//!
//! - `zmq`: push/pull ZeroMQ sockets towards the native engine
//! - `memory`: in-process channels with an [`EnginePeer`] standing in for
//!   the engine, for tests and local runs

mod memory;
mod zmq;

pub use memory::{ChannelTransport, EnginePeer};
pub use zmq::{BindState, DEFAULT_PULL_ENDPOINT, DEFAULT_PUSH_ENDPOINT, ZmqConfig, ZmqTransport};

/// Default capacity of the inbound frame channel.
pub const DEFAULT_INBOUND_CAPACITY: usize = 4_096;
