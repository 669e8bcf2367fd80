//! Inbound Frame Router
//!
//! One task drains the transport's inbound stream in arrival order and hands
//! each frame to the session tracker, the correlator and the frame feed, in
//! that order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::correlation::Correlator;
use super::session::SessionTracker;
use crate::application::ports::FrameFeed;
use crate::domain::frame::Frame;
use crate::infrastructure::metrics::{self, FrameKind};

/// Fans inbound frames out to their consumers.
pub struct FrameRouter {
    session: Arc<SessionTracker>,
    correlator: Arc<Correlator>,
    feed: Arc<dyn FrameFeed>,
}

impl FrameRouter {
    /// Router feeding the given consumers.
    pub fn new(
        session: Arc<SessionTracker>,
        correlator: Arc<Correlator>,
        feed: Arc<dyn FrameFeed>,
    ) -> Self {
        Self {
            session,
            correlator,
            feed,
        }
    }

    /// Route frames until the stream ends or `shutdown` fires.
    pub async fn run(self, mut inbound: mpsc::Receiver<Frame>, shutdown: CancellationToken) {
        tracing::info!("Frame router started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.route(frame),
                    None => {
                        tracing::warn!("Inbound frame stream closed");
                        break;
                    }
                },
            }
        }
        tracing::info!("Frame router stopped");
    }

    /// Route a single frame.
    pub fn route(&self, frame: Frame) {
        let kind = if frame.is_unsolicited() {
            FrameKind::Unsolicited
        } else if frame.is_response() {
            FrameKind::Response
        } else {
            FrameKind::Request
        };
        metrics::record_frame_received(kind);
        tracing::trace!(request_id = frame.request_id, event = ?frame.event(), "Inbound frame");

        self.session.observe(&frame);
        self.correlator.dispatch(&frame);
        self.feed.publish(Arc::new(frame));
    }
}

impl std::fmt::Debug for FrameRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRouter").finish_non_exhaustive()
    }
}
