//! Request Correlation
//!
//! Maps the engine's asynchronous, possibly multi-frame replies back onto the
//! request that caused them.
//!
//! # Lifecycle
//!
//! ```text
//! send() ──► register pending entry ──► transport.send(frame) ──► ReplyStream
//!                                                                    │
//! dispatch(frame) ──► entry by request_id ──► mpsc ──────────────────┘
//!                          │
//!                          └── removed on is_last, failure code, timeout or drop
//! ```
//!
//! Every pending entry carries a generation number. A stream only ever
//! removes the entry with its own generation, so an id that was freed by a
//! timeout and reused by a newer request is never touched by the old stream.
//!
//! # Reserved Codes
//!
//! `-1` and `-2` fail the request and raise exactly one restart signal per
//! occurrence. `-3` and other negative codes fail only the request. Positive
//! codes are engine business errors and are delivered in-band.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::application::ports::{FrameTransport, RestartReason, RestartSignal, TransportError};
use crate::domain::frame::{Frame, ReturnCode};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

// =============================================================================
// Errors
// =============================================================================

/// Reasons a correlated request can fail.
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    /// The request frame could not be handed to the transport.
    #[error("request send failed: {0}")]
    Transport(#[from] TransportError),

    /// Engine code `-1`.
    #[error("request {request_id} failed: engine network send failure (-1) {message}")]
    NetworkFailure {
        /// Request id.
        request_id: i32,
        /// Engine error message.
        message: String,
    },

    /// Engine code `-2`.
    #[error("request {request_id} failed: engine queue overflow (-2) {message}")]
    QueueOverflow {
        /// Request id.
        request_id: i32,
        /// Engine error message.
        message: String,
    },

    /// Engine code `-3`.
    #[error("request {request_id} failed: engine rate limited (-3) {message}")]
    RateLimited {
        /// Request id.
        request_id: i32,
        /// Engine error message.
        message: String,
    },

    /// Any other negative code.
    #[error("request {request_id} rejected by engine ({code}) {message}")]
    Rejected {
        /// Request id.
        request_id: i32,
        /// Raw return code.
        code: i32,
        /// Engine error message.
        message: String,
    },

    /// No terminal frame before the deadline.
    #[error("request {request_id} ({method}) timed out after {timeout:?}")]
    Timeout {
        /// Request id.
        request_id: i32,
        /// Request method.
        method: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The reply channel closed before a terminal frame.
    #[error("request {request_id} reply stream closed")]
    Closed {
        /// Request id.
        request_id: i32,
    },

    /// Every candidate request id is in flight.
    #[error("no free request id")]
    IdsExhausted,
}

impl CorrelationError {
    /// Raw engine return code, if the engine produced this failure.
    #[must_use]
    pub const fn engine_code(&self) -> Option<i32> {
        match self {
            Self::NetworkFailure { .. } => Some(-1),
            Self::QueueOverflow { .. } => Some(-2),
            Self::RateLimited { .. } => Some(-3),
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn from_engine(request_id: i32, code: ReturnCode, message: String) -> Self {
        match code {
            ReturnCode::NetworkFailure => Self::NetworkFailure {
                request_id,
                message,
            },
            ReturnCode::QueueOverflow => Self::QueueOverflow {
                request_id,
                message,
            },
            ReturnCode::RateLimited => Self::RateLimited {
                request_id,
                message,
            },
            other => Self::Rejected {
                request_id,
                code: other.code(),
                message,
            },
        }
    }
}

// =============================================================================
// Id Allocation
// =============================================================================

/// Wrapping positive id generator.
///
/// Yields `1, 2, ..., i32::MAX, 1, ...`, skipping ids the caller reports as
/// still in use.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    next: i32,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    /// Generator starting at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Generator starting at `next` (clamped to at least 1).
    #[must_use]
    pub const fn starting_at(next: i32) -> Self {
        Self {
            next: if next < 1 { 1 } else { next },
        }
    }

    /// Next id, ignoring whether it is in use.
    pub const fn advance(&mut self) -> i32 {
        let id = self.next;
        self.next = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Next id for which `in_use` is false.
    ///
    /// `outstanding` bounds the number of ids `in_use` can report, so at most
    /// `outstanding + 1` candidates are tried.
    pub fn allocate(&mut self, outstanding: usize, in_use: impl Fn(i32) -> bool) -> Option<i32> {
        (0..=outstanding)
            .map(|_| self.advance())
            .find(|id| !in_use(*id))
    }
}

// =============================================================================
// Pending Table
// =============================================================================

type ReplySender = mpsc::UnboundedSender<Result<Frame, CorrelationError>>;

struct PendingEntry {
    generation: u64,
    method: String,
    deadline: Instant,
    tx: ReplySender,
}

#[derive(Default)]
struct PendingTable {
    ids: IdGenerator,
    next_generation: u64,
    entries: HashMap<i32, PendingEntry>,
}

impl PendingTable {
    fn register(
        &mut self,
        method: &str,
        deadline: Instant,
        tx: ReplySender,
    ) -> Result<(i32, u64), CorrelationError> {
        let entries = &self.entries;
        let request_id = self
            .ids
            .allocate(entries.len(), |id| entries.contains_key(&id))
            .ok_or(CorrelationError::IdsExhausted)?;
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(
            request_id,
            PendingEntry {
                generation,
                method: method.to_string(),
                deadline,
                tx,
            },
        );
        Ok((request_id, generation))
    }

    fn release(&mut self, request_id: i32, generation: u64) {
        if self
            .entries
            .get(&request_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.entries.remove(&request_id);
        }
    }
}

// =============================================================================
// Correlator
// =============================================================================

/// What `dispatch` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Non-terminal frame delivered.
    Delivered,
    /// Terminal frame delivered; entry removed.
    Completed,
    /// Reserved / negative code; request failed and entry removed.
    Failed,
    /// No pending entry for this id.
    Unmatched,
    /// Entry existed but its deadline had passed; removed, frame discarded.
    Expired,
    /// Not a response frame.
    Ignored,
}

/// Request-id allocator and reply demultiplexer.
pub struct Correlator {
    transport: Arc<dyn FrameTransport>,
    restart: Arc<dyn RestartSignal>,
    table: Arc<Mutex<PendingTable>>,
    request_timeout: Duration,
}

impl Correlator {
    /// Create a correlator over `transport`.
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        restart: Arc<dyn RestartSignal>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            restart,
            table: Arc::new(Mutex::new(PendingTable::default())),
            request_timeout,
        }
    }

    /// Start ids at `next` instead of 1.
    #[must_use]
    pub fn with_first_id(self, next: i32) -> Self {
        self.table.lock().ids = IdGenerator::starting_at(next);
        self
    }

    /// Configured per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of requests currently awaiting a terminal frame.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Send a request with the default timeout.
    ///
    /// # Errors
    ///
    /// Fails if no request id is free or the transport rejects the frame.
    pub async fn send(&self, method: &str, params: Value) -> Result<ReplyStream, CorrelationError> {
        self.send_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Send a request with an explicit timeout.
    ///
    /// The pending entry is registered before the frame leaves, so a reply
    /// can never overtake its registration.
    ///
    /// The send itself is bounded by the request deadline, so a transport
    /// that stops accepting frames times the request out like a silent
    /// engine would.
    ///
    /// # Errors
    ///
    /// Fails if no request id is free, the transport rejects the frame or
    /// the frame is not accepted before the deadline.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<ReplyStream, CorrelationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let deadline = Instant::now() + timeout;
        let (request_id, generation) = self.table.lock().register(method, deadline, tx)?;

        let stream = ReplyStream {
            request_id,
            generation,
            method: method.to_string(),
            deadline,
            timeout,
            rx,
            table: Arc::clone(&self.table),
            finished: false,
        };

        tracing::info!(request_id, method, "Sending request to engine");
        let frame = Frame::request(request_id, method, params);
        match tokio::time::timeout_at(deadline, self.transport.send(frame)).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => {
                tracing::warn!(request_id, method, error = %e, "Request send failed");
                Err(e.into())
            }
            // Dropping the stream frees the id.
            Err(_) => {
                tracing::warn!(request_id, method, "Request send stalled past its deadline");
                Err(CorrelationError::Timeout {
                    request_id,
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Route one inbound frame to its pending request.
    pub fn dispatch(&self, frame: &Frame) -> DispatchOutcome {
        let Some(res) = frame.res.as_ref() else {
            return DispatchOutcome::Ignored;
        };
        let request_id = frame.request_id;
        let code = ReturnCode::from_code(res.error_code);

        let restart_reason = {
            let mut table = self.table.lock();
            let Some(entry) = table.entries.get(&request_id) else {
                if request_id != 0 {
                    tracing::debug!(request_id, "Discarding frame for unknown request id");
                }
                return DispatchOutcome::Unmatched;
            };

            if entry.deadline <= Instant::now() {
                tracing::debug!(request_id, "Discarding late frame for expired request");
                table.entries.remove(&request_id);
                return DispatchOutcome::Expired;
            }

            if !code.is_failure() {
                if entry.tx.send(Ok(frame.clone())).is_err() || frame.is_last() {
                    table.entries.remove(&request_id);
                }
                return if frame.is_last() {
                    DispatchOutcome::Completed
                } else {
                    DispatchOutcome::Delivered
                };
            }

            let Some(entry) = table.entries.remove(&request_id) else {
                return DispatchOutcome::Unmatched;
            };
            tracing::warn!(
                request_id,
                method = %entry.method,
                code = code.code(),
                message = %res.error_message,
                "Engine failed request"
            );
            let _ = entry.tx.send(Err(CorrelationError::from_engine(
                request_id,
                code,
                res.error_message.clone(),
            )));

            match code {
                ReturnCode::NetworkFailure => Some(RestartReason::NetworkFailure),
                ReturnCode::QueueOverflow => Some(RestartReason::QueueOverflow),
                _ => None,
            }
        };

        if let Some(reason) = restart_reason {
            let queued = self.restart.request_restart(reason);
            tracing::warn!(request_id, %reason, queued, "Engine restart requested");
        }
        DispatchOutcome::Failed
    }
}

// =============================================================================
// Reply Stream
// =============================================================================

/// Caller's handle on one pending request.
///
/// Yields response frames in arrival order and ends after the terminal frame
/// or the first error. Dropping the stream frees the request id.
pub struct ReplyStream {
    request_id: i32,
    generation: u64,
    method: String,
    deadline: Instant,
    timeout: Duration,
    rx: mpsc::UnboundedReceiver<Result<Frame, CorrelationError>>,
    table: Arc<Mutex<PendingTable>>,
    finished: bool,
}

impl ReplyStream {
    /// Request id on the wire.
    #[must_use]
    pub const fn request_id(&self) -> i32 {
        self.request_id
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Absolute deadline of this request.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Next frame, `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<Frame, CorrelationError>> {
        if self.finished {
            return None;
        }

        let item = match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
            Ok(Some(Ok(frame))) => {
                self.finished = frame.is_last();
                Ok(frame)
            }
            Ok(Some(Err(e))) => {
                self.finished = true;
                Err(e)
            }
            Ok(None) if Instant::now() < self.deadline => {
                self.finished = true;
                Err(CorrelationError::Closed {
                    request_id: self.request_id,
                })
            }
            Ok(None) | Err(_) => {
                self.finished = true;
                self.release();
                tracing::warn!(
                    request_id = self.request_id,
                    method = %self.method,
                    "Request timed out"
                );
                Err(CorrelationError::Timeout {
                    request_id: self.request_id,
                    method: self.method.clone(),
                    timeout: self.timeout,
                })
            }
        };
        Some(item)
    }

    /// Drain every frame up to and including the terminal one.
    ///
    /// # Errors
    ///
    /// Returns the first failure; frames received before it are discarded.
    pub async fn collect(mut self) -> Result<Vec<Frame>, CorrelationError> {
        let mut frames = Vec::new();
        while let Some(item) = self.next().await {
            frames.push(item?);
        }
        Ok(frames)
    }

    /// Drain the stream and return only the terminal frame.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the stream.
    pub async fn terminal(self) -> Result<Frame, CorrelationError> {
        let request_id = self.request_id;
        self.collect()
            .await?
            .pop()
            .ok_or(CorrelationError::Closed { request_id })
    }

    fn release(&self) {
        self.table.lock().release(self.request_id, self.generation);
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyStream")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
