//! ZeroMQ Transport
//!
//! The bridge binds a PUSH socket the engine's PULL side connects to, and
//! connects a PULL socket to the engine's PUSH side. Each socket is owned by
//! one task:
//!
//! - writer: binds, then drains the outbound queue in FIFO order, replying
//!   to each sender with the socket result
//! - reader: connects, decodes every message as one frame and forwards it
//! - monitor: counts engine connections to the push socket
//!
//! Sends issued before the bind completes wait in the queue and leave in
//! submission order once it does.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use zeromq::{PullSocket, PushSocket, Socket, SocketEvent, SocketRecv, SocketSend, ZmqMessage};

use super::DEFAULT_INBOUND_CAPACITY;
use crate::application::ports::{FrameTransport, TransportError};
use crate::domain::frame::Frame;
use crate::infrastructure::metrics;

/// Default push (bind) endpoint.
pub const DEFAULT_PUSH_ENDPOINT: &str = "tcp://0.0.0.0:5701";

/// Default pull (connect) endpoint.
pub const DEFAULT_PULL_ENDPOINT: &str = "tcp://127.0.0.1:5700";

type Outbound = (Vec<u8>, oneshot::Sender<Result<(), TransportError>>);

/// Socket configuration.
#[derive(Debug, Clone)]
pub struct ZmqConfig {
    /// Endpoint the push socket binds.
    pub push_endpoint: String,
    /// Endpoint the pull socket connects to.
    pub pull_endpoint: String,
    /// Inbound frame channel capacity.
    pub inbound_capacity: usize,
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
    /// Pause before retrying a failed pull connect or receive.
    pub retry_pause: Duration,
}

impl Default for ZmqConfig {
    fn default() -> Self {
        Self {
            push_endpoint: DEFAULT_PUSH_ENDPOINT.to_string(),
            pull_endpoint: DEFAULT_PULL_ENDPOINT.to_string(),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            outbound_capacity: 1_024,
            retry_pause: Duration::from_secs(1),
        }
    }
}

/// Push socket bind progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindState {
    /// Bind not finished yet.
    Pending,
    /// Bound to the resolved endpoint.
    Bound(String),
    /// Bind failed; every send fails with this message.
    Failed(String),
}

/// ZeroMQ push/pull transport.
#[derive(Debug, Clone)]
pub struct ZmqTransport {
    push_endpoint: String,
    outbound: mpsc::Sender<Outbound>,
    bind: watch::Receiver<BindState>,
    peer_accepts: Arc<AtomicU64>,
}

impl ZmqTransport {
    /// Spawn the socket tasks. Returns the transport and the inbound frame
    /// stream. Tasks stop when `cancel` fires.
    #[must_use]
    pub fn start(config: ZmqConfig, cancel: CancellationToken) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, queue) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (bind_tx, bind) = watch::channel(BindState::Pending);
        let peer_accepts = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_writer(
            config.push_endpoint.clone(),
            queue,
            bind_tx,
            Arc::clone(&peer_accepts),
            cancel.clone(),
        ));
        tokio::spawn(run_reader(
            config.pull_endpoint,
            inbound_tx,
            config.retry_pause,
            cancel,
        ));

        let transport = Self {
            push_endpoint: config.push_endpoint,
            outbound,
            bind,
            peer_accepts,
        };
        (transport, inbound_rx)
    }

    /// Wait for the push socket bind. Returns the resolved endpoint.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Bind` if the bind failed, or
    /// `TransportError::Closed` if the writer stopped first.
    pub async fn ready(&self) -> Result<String, TransportError> {
        let mut bind = self.bind.clone();
        let state = bind
            .wait_for(|state| !matches!(state, BindState::Pending))
            .await
            .map_err(|_| TransportError::Closed)?
            .clone();
        match state {
            BindState::Bound(endpoint) => Ok(endpoint),
            BindState::Failed(message) => Err(TransportError::Bind {
                endpoint: self.push_endpoint.clone(),
                message,
            }),
            BindState::Pending => Err(TransportError::Closed),
        }
    }

    /// Current bind state.
    #[must_use]
    pub fn bind_state(&self) -> BindState {
        self.bind.borrow().clone()
    }

    /// Times the engine connected to the push socket.
    #[must_use]
    pub fn peer_accepts(&self) -> u64 {
        self.peer_accepts.load(Ordering::Relaxed)
    }

    /// Shared peer-accept counter.
    #[must_use]
    pub fn peer_accept_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.peer_accepts)
    }
}

#[async_trait]
impl FrameTransport for ZmqTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        let (reply, result) = oneshot::channel();
        self.outbound
            .send((bytes, reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        result.await.map_err(|_| TransportError::Closed)?
    }
}

// =============================================================================
// Socket Tasks
// =============================================================================

async fn run_writer(
    endpoint: String,
    mut queue: mpsc::Receiver<Outbound>,
    bind: watch::Sender<BindState>,
    peer_accepts: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut socket = PushSocket::new();
    tokio::spawn(run_monitor(socket.monitor(), peer_accepts, cancel.clone()));

    match socket.bind(&endpoint).await {
        Ok(bound) => {
            tracing::info!(endpoint = %bound, "Push socket bound");
            bind.send_replace(BindState::Bound(bound.to_string()));
        }
        Err(e) => {
            let message = e.to_string();
            tracing::error!(%endpoint, error = %message, "Push socket bind failed");
            bind.send_replace(BindState::Failed(message.clone()));
            fail_queued(&endpoint, &message, &mut queue, &cancel).await;
            return;
        }
    }

    loop {
        let (bytes, reply) = tokio::select! {
            () = cancel.cancelled() => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        // The caller timed out while the frame was queued.
        if reply.is_closed() {
            tracing::debug!("Skipping frame abandoned by its caller");
            continue;
        }

        let result = tokio::select! {
            () = cancel.cancelled() => break,
            sent = socket.send(ZmqMessage::from(bytes)) => {
                sent.map_err(|e| TransportError::Socket(e.to_string()))
            }
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Push socket send failed");
        }
        // Caller may have given up.
        let _ = reply.send(result);
    }

    tracing::debug!("Push socket writer stopped");
}

async fn fail_queued(
    endpoint: &str,
    message: &str,
    queue: &mut mpsc::Receiver<Outbound>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            item = queue.recv() => match item {
                Some((_, reply)) => {
                    let _ = reply.send(Err(TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        message: message.to_string(),
                    }));
                }
                None => break,
            },
        }
    }
}

async fn run_monitor(
    mut events: futures::channel::mpsc::Receiver<SocketEvent>,
    peer_accepts: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            SocketEvent::Accepted(endpoint, _) => {
                let total = peer_accepts.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(%endpoint, total, "Engine connected to push socket");
            }
            SocketEvent::Disconnected(_) => {
                tracing::info!("Engine disconnected from push socket");
            }
            other => tracing::debug!(event = ?other, "Push socket event"),
        }
    }
}

async fn run_reader(
    endpoint: String,
    inbound: mpsc::Sender<Frame>,
    retry_pause: Duration,
    cancel: CancellationToken,
) {
    'connect: loop {
        let mut socket = PullSocket::new();
        let connected = tokio::select! {
            () = cancel.cancelled() => return,
            result = socket.connect(&endpoint) => result,
        };
        if let Err(e) = connected {
            tracing::warn!(%endpoint, error = %e, "Pull socket connect failed");
            if pause(retry_pause, &cancel).await {
                continue;
            }
            return;
        }
        tracing::info!(%endpoint, "Pull socket connected");

        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => return,
                received = socket.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Pull socket receive failed, reconnecting");
                    if pause(retry_pause, &cancel).await {
                        continue 'connect;
                    }
                    return;
                }
            };

            let Some(bytes) = message.get(0) else {
                tracing::warn!("Dropping empty engine message");
                metrics::record_frame_dropped("empty");
                continue;
            };

            match Frame::decode(bytes) {
                Ok(frame) => {
                    if inbound.send(frame).await.is_err() {
                        tracing::info!("Inbound frame receiver dropped, reader stopping");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, len = bytes.len(), "Dropping undecodable engine message");
                    metrics::record_frame_dropped("parse");
                }
            }
        }
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
