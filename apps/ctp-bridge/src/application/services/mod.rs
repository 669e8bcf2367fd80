//! Application Services
//!
//! Services that own the bridge's request lifecycle and coordinate between
//! ports.
//!
//! - `Correlator`: Request ids, reply demultiplexing, per-request timeouts
//! - `SessionTracker`: Login / settlement state machine
//! - `TierAdmission`: FIFO concurrency, rate and backlog control per tier
//! - `Gateway`: Routing, readiness gating and admission in front of the correlator
//! - `OrderActions`: Order insert / cancel racing order returns against errors
//! - `LivenessProbe`: No-op ping through the correlator
//! - `FrameRouter`: Fans inbound frames out to the services above

mod admission;
mod correlation;
mod gateway;
mod liveness;
mod orders;
mod router;
mod session;

pub use admission::{
    AdmissionError, AdmissionPermit, TierAdmission, TierLimits, TierStats, TokenBucket,
};
pub use correlation::{
    CorrelationError, Correlator, DEFAULT_REQUEST_TIMEOUT, DispatchOutcome, IdGenerator,
    ReplyStream,
};
pub use gateway::{
    AdmittedCall, CallOutcome, Fault, FaultKind, Gateway, GatewayConfig, GatewayError,
    ServiceRequest,
};
pub use liveness::{LivenessConfig, LivenessError, LivenessProbe, LivenessReport};
pub use orders::{ORDER_RETURN_EVENT, OrderActions, OrderOutcome, parse_exchange_order_id};
pub use router::FrameRouter;
pub use session::{LOGIN_EVENT, SETTLEMENT_EVENT, SessionTracker};
