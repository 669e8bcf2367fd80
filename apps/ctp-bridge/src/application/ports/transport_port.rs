//! Frame Transport Port (Driven Port)
//!
//! Outbound half of the engine link. Inbound frames are not part of the
//! trait: each adapter hands out an `mpsc::Receiver<Frame>` when it starts,
//! and the frame router drains it.

use async_trait::async_trait;

use crate::domain::frame::{Frame, FrameError};

/// Errors surfaced by a transport send.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The frame could not be encoded.
    #[error("frame encoding failed: {0}")]
    Encode(#[from] FrameError),

    /// The push socket could not be bound.
    #[error("bind to {endpoint} failed: {message}")]
    Bind {
        /// Endpoint that failed to bind.
        endpoint: String,
        /// Socket error text.
        message: String,
    },

    /// The push socket reported an error for this send.
    #[error("socket send failed: {0}")]
    Socket(String),

    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
}

/// Outbound frame transport towards the native engine.
///
/// Implementations must preserve submission order: frames passed to
/// concurrent `send` calls leave in the order the calls were made.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Send one frame, returning once the socket accepted it.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
}
