//! Rate-Limited Gateway
//!
//! The single entry point for external callers. A call goes through:
//!
//! 1. account check
//! 2. tier routing by method name
//! 3. session readiness (fail fast, nothing is queued waiting for login)
//! 4. tier admission (FIFO, concurrency, rate, backlog)
//! 5. readiness re-check (the engine may have restarted while queued)
//! 6. correlation, bounded by the per-request timeout
//!
//! The gateway never retries. Every failure is reported as a [`Fault`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use super::admission::{AdmissionError, AdmissionPermit, TierAdmission, TierLimits, TierStats};
use super::correlation::{CorrelationError, Correlator, ReplyStream};
use crate::domain::frame::Frame;
use crate::domain::session::{Readiness, SessionState};
use crate::domain::tier::ServiceTier;
use crate::infrastructure::metrics;

// =============================================================================
// Faults
// =============================================================================

/// Caller-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Push-side socket failure or engine code `-1`.
    Transport,
    /// Engine queue overflow (`-2`) or exhausted request ids.
    Capacity,
    /// Gateway backlog full.
    Overflow,
    /// Engine rate limiting (`-3`).
    Rate,
    /// Other negative engine code.
    Protocol,
    /// Session not logged in / settlement not confirmed.
    Readiness,
    /// No terminal frame within the deadline.
    Timeout,
    /// Wrong account, wrong service for the method, malformed input.
    Routing,
    /// Order actions disabled.
    Forbidden,
}

impl FaultKind {
    /// Label used in metrics and responses.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Capacity => "capacity",
            Self::Overflow => "overflow",
            Self::Rate => "rate",
            Self::Protocol => "protocol",
            Self::Readiness => "readiness",
            Self::Timeout => "timeout",
            Self::Routing => "routing",
            Self::Forbidden => "forbidden",
        }
    }
}

/// Structured failure returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    /// Failure class.
    pub kind: FaultKind,
    /// Human readable message.
    pub message: String,
    /// Engine return code, when the engine produced the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// Gateway call failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The call named an account this bridge does not serve.
    #[error("account {requested} is not served here (expected {expected})")]
    AccountMismatch {
        /// Account named by the caller.
        requested: String,
        /// Account served by this bridge.
        expected: String,
    },

    /// The method does not belong to the service it was sent to.
    #[error("method {method} is not accepted by the {service} service")]
    Routing {
        /// Requested method.
        method: String,
        /// Service name.
        service: &'static str,
    },

    /// Malformed call input.
    #[error("invalid request: {0}")]
    InvalidInput(String),

    /// Required session state not reached.
    #[error("CTP not ready: {tier} calls require {required}, session is {current}")]
    NotReady {
        /// Tier of the call.
        tier: ServiceTier,
        /// Required readiness.
        required: &'static str,
        /// Current session state.
        current: &'static str,
    },

    /// Login snapshot requested before login.
    #[error("CTP not logged in")]
    NotLoggedIn,

    /// Settlement snapshot requested before confirmation.
    #[error("CTP settlement not confirmed")]
    SettlementNotConfirmed,

    /// Order actions disabled by configuration.
    #[error("order actions are disabled on this bridge")]
    TradingDisabled,

    /// Tier admission failure.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Correlated request failure.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// Order action got neither an order return nor an error in time.
    #[error("{action} timed out after {timeout:?}")]
    OrderTimeout {
        /// `SubmitOrder` or `CancelOrder`.
        action: &'static str,
        /// Shared deadline length.
        timeout: Duration,
    },

    /// The inbound frame feed closed.
    #[error("frame feed closed")]
    FeedClosed,
}

impl GatewayError {
    /// Failure class.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::AccountMismatch { .. } | Self::Routing { .. } | Self::InvalidInput(_) => {
                FaultKind::Routing
            }
            Self::NotReady { .. } | Self::NotLoggedIn | Self::SettlementNotConfirmed => {
                FaultKind::Readiness
            }
            Self::TradingDisabled => FaultKind::Forbidden,
            Self::Admission(AdmissionError::Overflow { .. }) => FaultKind::Overflow,
            Self::Admission(AdmissionError::Closed { .. }) => FaultKind::Capacity,
            Self::Correlation(e) => match e {
                CorrelationError::Transport(_)
                | CorrelationError::NetworkFailure { .. }
                | CorrelationError::Closed { .. } => FaultKind::Transport,
                CorrelationError::QueueOverflow { .. } | CorrelationError::IdsExhausted => {
                    FaultKind::Capacity
                }
                CorrelationError::RateLimited { .. } => FaultKind::Rate,
                CorrelationError::Rejected { .. } => FaultKind::Protocol,
                CorrelationError::Timeout { .. } => FaultKind::Timeout,
            },
            Self::OrderTimeout { .. } => FaultKind::Timeout,
            Self::FeedClosed => FaultKind::Transport,
        }
    }

    /// Engine return code, if any.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Correlation(e) => e.engine_code(),
            _ => None,
        }
    }

    /// Structured form.
    #[must_use]
    pub fn to_fault(&self) -> Fault {
        Fault {
            kind: self.kind(),
            message: self.to_string(),
            code: self.code(),
        }
    }
}

// =============================================================================
// Requests and Outcomes
// =============================================================================

/// Body of a `Query` / `Md` service call.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRequest {
    /// Account the call targets.
    pub account_id: String,
    /// Native method.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// Frames delivered for a successful call.
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    /// Terminal frame.
    pub frame: Frame,
    /// Every frame, terminal included, in arrival order.
    pub frames: Vec<Frame>,
}

/// An admitted call whose replies have not been drained yet.
///
/// Holds the tier's concurrency slot until dropped.
#[derive(Debug)]
pub struct AdmittedCall {
    stream: ReplyStream,
    _permit: AdmissionPermit,
}

impl AdmittedCall {
    /// Request id on the wire.
    #[must_use]
    pub const fn request_id(&self) -> i32 {
        self.stream.request_id()
    }

    /// Next reply frame.
    pub async fn next(&mut self) -> Option<Result<Frame, CorrelationError>> {
        self.stream.next().await
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Account served by this bridge (`BROKER_ID/USER_ID`).
    pub account_id: String,
    /// Per-tier admission limits.
    pub tiers: HashMap<ServiceTier, TierLimits>,
    /// Reject all order actions.
    pub no_trade: bool,
}

/// Rate-limited entry point over the correlator.
pub struct Gateway {
    account_id: String,
    correlator: Arc<Correlator>,
    session: watch::Receiver<SessionState>,
    tiers: HashMap<ServiceTier, TierAdmission>,
    no_trade: bool,
}

impl Gateway {
    /// Build a gateway. Tiers missing from `config.tiers` get `1 / 1 / 60`.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        correlator: Arc<Correlator>,
        session: watch::Receiver<SessionState>,
    ) -> Self {
        let tiers = ServiceTier::ALL
            .into_iter()
            .map(|tier| {
                let limits = config.tiers.get(&tier).copied().unwrap_or(TierLimits {
                    max_concurrent: 1,
                    rate_per_sec: 1,
                    backlog_multiplier: 60,
                });
                (tier, TierAdmission::new(tier, limits))
            })
            .collect();

        Self {
            account_id: config.account_id,
            correlator,
            session,
            tiers,
            no_trade: config.no_trade,
        }
    }

    /// Account served by this gateway.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Whether order actions are disabled.
    #[must_use]
    pub const fn no_trade(&self) -> bool {
        self.no_trade
    }

    /// Correlator behind the gateway.
    #[must_use]
    pub const fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Current session snapshot.
    #[must_use]
    pub fn session(&self) -> SessionState {
        self.session.borrow().clone()
    }

    /// Admission statistics for every tier.
    #[must_use]
    pub fn tier_stats(&self) -> Vec<TierStats> {
        ServiceTier::ALL
            .iter()
            .filter_map(|tier| self.tiers.get(tier))
            .map(TierAdmission::stats)
            .collect()
    }

    /// `Query` service: query and order-action methods.
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`]; see [`FaultKind`] for the classes.
    pub async fn query(&self, request: ServiceRequest) -> Result<CallOutcome, GatewayError> {
        self.check_account(&request.account_id)?;
        let tier = match ServiceTier::classify(&request.method) {
            Some(tier @ (ServiceTier::Query | ServiceTier::OrderAction)) => tier,
            _ => {
                return Err(GatewayError::Routing {
                    method: request.method,
                    service: "Query",
                });
            }
        };
        self.call(tier, &request.method, request.params).await
    }

    /// `Md` service: session bootstrap and subscription methods.
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`]; see [`FaultKind`] for the classes.
    pub async fn market_data(&self, request: ServiceRequest) -> Result<CallOutcome, GatewayError> {
        self.check_account(&request.account_id)?;
        if !ServiceTier::MarketData.accepts(&request.method) {
            return Err(GatewayError::Routing {
                method: request.method,
                service: "Md",
            });
        }
        self.call(ServiceTier::MarketData, &request.method, request.params)
            .await
    }

    /// Run one call on `tier` and drain its replies.
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`]; see [`FaultKind`] for the classes.
    pub async fn call(
        &self,
        tier: ServiceTier,
        method: &str,
        params: Value,
    ) -> Result<CallOutcome, GatewayError> {
        let started = Instant::now();
        let result = self.drain(tier, method, params).await;
        let outcome = result.as_ref().map_or_else(|e| e.kind().as_str(), |_| "ok");
        metrics::record_request(tier, outcome, started.elapsed());
        result
    }

    async fn drain(
        &self,
        tier: ServiceTier,
        method: &str,
        params: Value,
    ) -> Result<CallOutcome, GatewayError> {
        let AdmittedCall {
            stream,
            _permit: permit,
        } = self.open(tier, method, params).await?;
        let request_id = stream.request_id();
        let frames = stream.collect().await?;
        drop(permit);

        let frame = frames
            .last()
            .cloned()
            .ok_or(CorrelationError::Closed { request_id })?;
        Ok(CallOutcome { frame, frames })
    }

    /// Admit and send one call, returning the open reply stream.
    ///
    /// # Errors
    ///
    /// Fails on routing, readiness, admission or send errors.
    pub async fn open(
        &self,
        tier: ServiceTier,
        method: &str,
        params: Value,
    ) -> Result<AdmittedCall, GatewayError> {
        if tier == ServiceTier::OrderAction && self.no_trade {
            return Err(GatewayError::TradingDisabled);
        }
        self.require(tier)?;

        let admission = self
            .tiers
            .get(&tier)
            .ok_or(AdmissionError::Closed { tier })?;
        let permit = admission.admit().await?;

        self.require(tier)?;
        let stream = self.correlator.send(method, params).await?;
        Ok(AdmittedCall {
            stream,
            _permit: permit,
        })
    }

    /// Check the session reached what `tier` needs.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::NotReady` otherwise.
    pub fn require(&self, tier: ServiceTier) -> Result<SessionState, GatewayError> {
        let required = tier.required_readiness();
        let state = self.session();
        if state.satisfies(required) {
            Ok(state)
        } else {
            Err(GatewayError::NotReady {
                tier,
                required: required.as_str(),
                current: state.as_str(),
            })
        }
    }

    /// `QueryLoginResponse`: the captured login payload.
    ///
    /// # Errors
    ///
    /// Fails before login or for a foreign account.
    pub fn login_response(&self, account_id: &str) -> Result<Value, GatewayError> {
        self.check_account(account_id)?;
        self.session
            .borrow()
            .login()
            .map(|login| login.raw.clone())
            .ok_or(GatewayError::NotLoggedIn)
    }

    /// `QuerySettlementResponse`: the captured settlement payload.
    ///
    /// # Errors
    ///
    /// Fails before settlement confirmation or for a foreign account.
    pub fn settlement_response(&self, account_id: &str) -> Result<Value, GatewayError> {
        self.check_account(account_id)?;
        self.session
            .borrow()
            .settlement()
            .map(|settlement| settlement.raw.clone())
            .ok_or(GatewayError::SettlementNotConfirmed)
    }

    /// Reject calls for other accounts.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AccountMismatch`.
    pub fn check_account(&self, account_id: &str) -> Result<(), GatewayError> {
        if account_id == self.account_id {
            Ok(())
        } else {
            Err(GatewayError::AccountMismatch {
                requested: account_id.to_string(),
                expected: self.account_id.clone(),
            })
        }
    }

    /// Whether the session has reached `readiness`.
    #[must_use]
    pub fn is_ready(&self, readiness: Readiness) -> bool {
        self.session.borrow().satisfies(readiness)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("account_id", &self.account_id)
            .field("no_trade", &self.no_trade)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use test_case::test_case;

    use super::*;
    use crate::application::ports::{
        FrameTransport, RestartReason, RestartSignal, TransportError,
    };
    use crate::application::services::session::SessionTracker;
    use crate::domain::frame::ResponseBody;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl FrameTransport for RecordingTransport {
        async fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.sent.lock().push(frame);
            Ok(())
        }
    }

    struct NoRestart;

    impl RestartSignal for NoRestart {
        fn request_restart(&self, _reason: RestartReason) -> bool {
            false
        }
    }

    fn gateway(no_trade: bool) -> (Gateway, Arc<RecordingTransport>, SessionTracker) {
        let transport = Arc::new(RecordingTransport::default());
        let correlator = Arc::new(Correlator::new(
            Arc::clone(&transport) as _,
            Arc::new(NoRestart),
            Duration::from_secs(5),
        ));
        let tracker = SessionTracker::new();
        let config = GatewayConfig {
            account_id: "9999/1001".to_string(),
            tiers: HashMap::new(),
            no_trade,
        };
        (Gateway::new(config, correlator, tracker.subscribe()), transport, tracker)
    }

    fn event(name: &str) -> Frame {
        Frame::response(0, ResponseBody::ok(name, Some(json!({"FrontID": 1, "SessionID": 2})), true))
    }

    fn request(method: &str) -> ServiceRequest {
        ServiceRequest {
            account_id: "9999/1001".to_string(),
            method: method.to_string(),
            params: json!({}),
        }
    }

    #[tokio::test]
    async fn rejects_before_settlement_without_sending() {
        let (gateway, transport, tracker) = gateway(false);
        let err = gateway.query(request("ReqQryTrade")).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::Readiness);

        tracker.observe(&event("OnRspUserLogin"));
        let err = gateway.query(request("ReqQryTrade")).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::Readiness);
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn market_data_needs_only_login() {
        let (gateway, transport, tracker) = gateway(false);
        tracker.observe(&event("OnRspUserLogin"));

        let call = gateway
            .open(ServiceTier::MarketData, "SubscribeMarketData", json!({}))
            .await
            .unwrap();
        assert_eq!(call.request_id(), 1);
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[test_case("ReqUserLogin", true; "md method on query")]
    #[test_case("ReqSettlementInfoConfirm", true; "unknown method on query")]
    #[test_case("ReqQryTrade", false; "query method on md")]
    #[tokio::test]
    async fn wrong_service_is_routing_fault(method: &str, on_query: bool) {
        let (gateway, _, _) = gateway(false);
        let err = if on_query {
            gateway.query(request(method)).await.unwrap_err()
        } else {
            gateway.market_data(request(method)).await.unwrap_err()
        };
        assert_eq!(err.kind(), FaultKind::Routing);
    }

    #[tokio::test]
    async fn foreign_account_is_rejected() {
        let (gateway, _, _) = gateway(false);
        let mut req = request("ReqQryTrade");
        req.account_id = "other".to_string();
        let err = gateway.query(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::AccountMismatch { .. }));
        assert_eq!(err.to_fault().kind, FaultKind::Routing);
    }

    #[tokio::test]
    async fn no_trade_forbids_order_actions() {
        let (gateway, _, tracker) = gateway(true);
        tracker.observe(&event("OnRspUserLogin"));
        tracker.observe(&event("OnRspSettlementInfoConfirm"));
        let err = gateway.query(request("ReqOrderInsert")).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::Forbidden);
    }

    #[test]
    fn snapshots_follow_session() {
        let (gateway, _, tracker) = gateway(false);
        assert!(matches!(
            gateway.login_response("9999/1001"),
            Err(GatewayError::NotLoggedIn)
        ));

        tracker.observe(&event("OnRspUserLogin"));
        assert_eq!(gateway.login_response("9999/1001").unwrap()["SessionID"], 2);
        assert!(matches!(
            gateway.settlement_response("9999/1001"),
            Err(GatewayError::SettlementNotConfirmed)
        ));

        tracker.observe(&event("OnRspSettlementInfoConfirm"));
        assert!(gateway.settlement_response("9999/1001").is_ok());
        assert!(gateway.is_ready(Readiness::SettlementConfirmed));
    }

    #[test]
    fn fault_serializes_with_optional_code() {
        let err = GatewayError::Correlation(CorrelationError::QueueOverflow {
            request_id: 4,
            message: String::new(),
        });
        let fault = serde_json::to_value(err.to_fault()).unwrap();
        assert_eq!(fault["kind"], "capacity");
        assert_eq!(fault["code"], -2);

        let fault = serde_json::to_value(GatewayError::TradingDisabled.to_fault()).unwrap();
        assert_eq!(fault["kind"], "forbidden");
        assert!(fault.get("code").is_none());
    }
}
