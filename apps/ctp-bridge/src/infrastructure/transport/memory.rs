//! In-Memory Transport
//!
//! Channel-backed transport with an [`EnginePeer`] on the other end. The
//! peer sees every outbound request frame and injects inbound frames, so
//! tests can script the engine without sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::application::ports::{FrameTransport, TransportError};
use crate::domain::frame::{Frame, ResponseBody};

/// Transport half handed to the correlator.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    outbound: mpsc::Sender<Frame>,
    fail_sends: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Create a connected transport, its inbound stream and the engine peer.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Frame>, EnginePeer) {
        let (outbound, requests) = mpsc::channel(capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        let fail_sends = Arc::new(AtomicBool::new(false));

        let transport = Self {
            outbound,
            fail_sends: Arc::clone(&fail_sends),
        };
        let peer = EnginePeer {
            requests,
            inbound: inbound_tx,
            fail_sends,
        };
        (transport, inbound_rx, peer)
    }
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(TransportError::Socket("send failure injected".to_string()));
        }
        // Same validation the wire applies.
        frame.encode()?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Scripted stand-in for the native engine.
#[derive(Debug)]
pub struct EnginePeer {
    requests: mpsc::Receiver<Frame>,
    inbound: mpsc::Sender<Frame>,
    fail_sends: Arc<AtomicBool>,
}

impl EnginePeer {
    /// Next request sent by the bridge.
    pub async fn next_request(&mut self) -> Option<Frame> {
        self.requests.recv().await
    }

    /// Next request if one is already queued.
    pub fn try_next_request(&mut self) -> Option<Frame> {
        self.requests.try_recv().ok()
    }

    /// Deliver a frame to the bridge. Returns `false` if the bridge side is
    /// gone.
    pub async fn inject(&self, frame: Frame) -> bool {
        self.inbound.send(frame).await.is_ok()
    }

    /// Reply to `request_id`.
    pub async fn reply(&self, request_id: i32, res: ResponseBody) -> bool {
        self.inject(Frame::response(request_id, res)).await
    }

    /// Push an unsolicited event.
    pub async fn emit(&self, res: ResponseBody) -> bool {
        self.inject(Frame::response(crate::domain::frame::UNSOLICITED_REQUEST_ID, res))
            .await
    }

    /// Extra sender for injecting from other tasks.
    #[must_use]
    pub fn injector(&self) -> mpsc::Sender<Frame> {
        self.inbound.clone()
    }

    /// Make every subsequent bridge send fail with a socket error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn requests_and_replies_flow_both_ways() {
        let (transport, mut inbound, mut peer) = ChannelTransport::pair(8);

        transport
            .send(Frame::request(3, "ReqQryInstrument", json!({"InstrumentID": "au2412"})))
            .await
            .unwrap();
        let request = peer.next_request().await.unwrap();
        assert_eq!(request.request_id, 3);
        assert!(peer.try_next_request().is_none());

        assert!(
            peer.reply(3, ResponseBody::ok("OnRspQryInstrument", None, true))
                .await
        );
        assert_eq!(inbound.recv().await.unwrap().request_id, 3);
    }

    #[tokio::test]
    async fn injected_send_failure() {
        let (transport, _inbound, mut peer) = ChannelTransport::pair(8);
        peer.fail_sends(true);

        let result = transport.send(Frame::request(1, "ReqQryOrder", json!({}))).await;
        assert!(matches!(result, Err(TransportError::Socket(_))));
        assert!(peer.try_next_request().is_none());

        peer.fail_sends(false);
        assert!(transport.send(Frame::request(2, "ReqQryOrder", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_peer_closes_transport() {
        let (transport, _inbound, peer) = ChannelTransport::pair(8);
        drop(peer);
        assert!(matches!(
            transport.send(Frame::request(1, "ReqQryOrder", json!({}))).await,
            Err(TransportError::Closed)
        ));
    }
}
