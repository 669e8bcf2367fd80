//! Broadcast Channel Adapter
//!
//! Republishes every inbound engine frame on a tokio broadcast channel
//! (the `CTP/ZMQ` channel) for passive observers: market-data consumers,
//! the SSE endpoint and order actions waiting for `OnRtnOrder`.
//!
//! Slow receivers lag and skip frames; they never block the frame router.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::application::ports::{FrameBroadcast, FrameFeed};
use crate::domain::frame::Frame;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Configuration for the frame channel.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Frames buffered per receiver before it lags.
    pub capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Fan-out hub for inbound frames of one account.
///
/// # Example
///
/// ```rust
/// use ctp_bridge::infrastructure::broadcast::{BroadcastConfig, FrameHub};
///
/// let hub = FrameHub::new("9999/1001", BroadcastConfig::default());
/// let mut rx = hub.subscribe_frames();
/// assert_eq!(hub.receiver_count(), 1);
/// ```
#[derive(Debug)]
pub struct FrameHub {
    account_id: Arc<str>,
    tx: broadcast::Sender<FrameBroadcast>,
    published: AtomicU64,
    unobserved: AtomicU64,
}

impl FrameHub {
    /// Create a hub for `account_id`.
    #[must_use]
    pub fn new(account_id: &str, config: BroadcastConfig) -> Self {
        Self {
            account_id: Arc::from(account_id),
            tx: broadcast::channel(config.capacity.max(1)).0,
            published: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
        }
    }

    /// Account this hub publishes for.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Send a frame to all subscribers.
    ///
    /// Returns the number of receivers that got it, or `None` if there are
    /// no active receivers.
    #[must_use]
    pub fn send_frame(&self, frame: Arc<Frame>) -> Option<usize> {
        self.published.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .tx
            .send(FrameBroadcast {
                account_id: Arc::clone(&self.account_id),
                frame,
            })
            .ok();
        if sent.is_none() {
            self.unobserved.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Get a new receiver.
    #[must_use]
    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameBroadcast> {
        self.tx.subscribe()
    }

    /// Number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Channel statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            receivers: self.receiver_count(),
            published_total: self.published.load(Ordering::Relaxed),
            unobserved_total: self.unobserved.load(Ordering::Relaxed),
        }
    }
}

impl FrameFeed for FrameHub {
    fn publish(&self, frame: Arc<Frame>) -> usize {
        self.send_frame(frame).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<FrameBroadcast> {
        self.subscribe_frames()
    }
}

/// Shared hub reference.
pub type SharedFrameHub = Arc<FrameHub>;

/// Statistics about the frame channel.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BroadcastStats {
    /// Active receivers.
    pub receivers: usize,
    /// Frames published.
    pub published_total: u64,
    /// Frames published while nobody was listening.
    pub unobserved_total: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::frame::ResponseBody;

    fn frame(request_id: i32) -> Arc<Frame> {
        Arc::new(Frame::response(
            request_id,
            ResponseBody::ok("OnRtnOrder", Some(json!({"OrderRef": "1"})), true),
        ))
    }

    #[test]
    fn receiver_count_tracks_subscriptions() {
        let hub = FrameHub::new("9999/1001", BroadcastConfig::default());
        assert_eq!(hub.receiver_count(), 0);
        {
            let _rx1 = hub.subscribe_frames();
            let _rx2 = hub.subscribe_frames();
            assert_eq!(hub.receiver_count(), 2);
        }
        assert_eq!(hub.receiver_count(), 0);
    }

    #[tokio::test]
    async fn frames_are_tagged_with_account() {
        let hub = FrameHub::new("9999/1001", BroadcastConfig::default());
        let mut rx1 = hub.subscribe_frames();
        let mut rx2 = hub.subscribe();

        assert_eq!(hub.publish(frame(0)), 2);

        let r1 = rx1.recv().await.unwrap();
        let r2 = rx2.recv().await.unwrap();
        assert_eq!(&*r1.account_id, "9999/1001");
        assert!(Arc::ptr_eq(&r1.frame, &r2.frame));
    }

    #[test]
    fn send_with_no_receivers_is_counted() {
        let hub = FrameHub::new("9999/1001", BroadcastConfig::default());
        assert!(hub.send_frame(frame(1)).is_none());
        let stats = hub.stats();
        assert_eq!(stats.published_total, 1);
        assert_eq!(stats.unobserved_total, 1);
    }

    #[tokio::test]
    async fn slow_receiver_lags() {
        let hub = FrameHub::new("9999/1001", BroadcastConfig { capacity: 2 });
        let mut rx = hub.subscribe_frames();
        for id in 1..=4 {
            let _ = hub.send_frame(frame(id));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap().frame.request_id, 3);
    }
}
