//! Frame Feed Port (Driven Port)
//!
//! Every inbound frame is republished to passive observers, tagged with the
//! account it belongs to. Order actions use the same feed to wait for
//! `OnRtnOrder` returns.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::domain::frame::Frame;

/// One republished inbound frame.
#[derive(Debug, Clone)]
pub struct FrameBroadcast {
    /// Account the frame belongs to.
    pub account_id: Arc<str>,
    /// The frame, shared between all receivers.
    pub frame: Arc<Frame>,
}

/// Fan-out of inbound frames.
pub trait FrameFeed: Send + Sync {
    /// Republish a frame. Returns the number of receivers it reached.
    fn publish(&self, frame: Arc<Frame>) -> usize;

    /// Subscribe to frames published from now on.
    fn subscribe(&self) -> broadcast::Receiver<FrameBroadcast>;
}
