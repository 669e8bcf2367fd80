//! Service Surface
//!
//! HTTP stand-in for the terminal-bus registrations of the CTP terminal.
//!
//! # Endpoints
//!
//! - `POST /services/CTP/Query` - Query and order-action methods
//! - `POST /services/CTP/Md` - Session bootstrap and subscriptions
//! - `POST /services/CTP/QueryLoginResponse` - Captured login payload
//! - `POST /services/CTP/QuerySettlementResponse` - Captured settlement payload
//! - `POST /services/CTP/SubmitOrder` - Insert an order
//! - `POST /services/CTP/CancelOrder` - Cancel an order by exchange order id
//! - `POST /services/CTP/RestartEngine` - Queue an engine restart
//! - `GET /channels/CTP/ZMQ?account_id=` - Server-sent events, one per inbound frame
//!
//! Failures are `{"error": {"kind", "message", "code"?}}` with a status
//! derived from the fault kind.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{RestartReason, RestartSignal};
use crate::application::services::{FaultKind, Gateway, GatewayError, OrderActions, ServiceRequest};
use crate::infrastructure::broadcast::SharedFrameHub;
use crate::infrastructure::metrics;

// =============================================================================
// Request Bodies
// =============================================================================

/// Body of the snapshot services.
#[derive(Debug, Deserialize)]
pub struct AccountRequest {
    /// Account the call targets.
    pub account_id: String,
}

/// Body of `SubmitOrder`.
#[derive(Debug, Deserialize)]
pub struct SubmitOrderRequest {
    /// Account the call targets.
    pub account_id: String,
    /// `ReqOrderInsert` fields; identity fields are filled in.
    #[serde(default)]
    pub params: Value,
}

/// Body of `CancelOrder`.
#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    /// Account the call targets.
    pub account_id: String,
    /// `EXCHANGE-ORDERSYSID`.
    #[serde(default)]
    pub exchange_order_id: String,
}

/// Query string of the frame channel.
#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    /// Account to observe.
    pub account_id: String,
}

// =============================================================================
// Errors
// =============================================================================

/// A gateway failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ServiceFailure(pub GatewayError);

impl From<GatewayError> for ServiceFailure {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

/// HTTP status for a fault kind.
#[must_use]
pub const fn status_for(kind: FaultKind) -> StatusCode {
    match kind {
        FaultKind::Readiness => StatusCode::SERVICE_UNAVAILABLE,
        FaultKind::Overflow | FaultKind::Rate => StatusCode::TOO_MANY_REQUESTS,
        FaultKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        FaultKind::Routing => StatusCode::BAD_REQUEST,
        FaultKind::Forbidden => StatusCode::FORBIDDEN,
        FaultKind::Protocol | FaultKind::Transport | FaultKind::Capacity => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let fault = self.0.to_fault();
        (status_for(fault.kind), Json(json!({ "error": fault }))).into_response()
    }
}

/// Service server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Server
// =============================================================================

/// Shared state of the service surface.
pub struct ServiceState {
    gateway: Arc<Gateway>,
    orders: Arc<OrderActions>,
    hub: SharedFrameHub,
    restart: Arc<dyn RestartSignal>,
}

impl ServiceState {
    /// Create the state.
    #[must_use]
    pub fn new(
        gateway: Arc<Gateway>,
        orders: Arc<OrderActions>,
        hub: SharedFrameHub,
        restart: Arc<dyn RestartSignal>,
    ) -> Self {
        Self {
            gateway,
            orders,
            hub,
            restart,
        }
    }
}

impl std::fmt::Debug for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceState")
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

/// HTTP server for the service surface.
pub struct ServiceServer {
    port: u16,
    state: Arc<ServiceState>,
    cancel: CancellationToken,
}

impl ServiceServer {
    /// Create a new service server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<ServiceState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServiceServerError` if binding fails or the server stops on
    /// a fatal error.
    pub async fn run(self) -> Result<(), ServiceServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Service server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ServiceServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Service server stopped");
        Ok(())
    }
}

/// Service routes.
pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/services/CTP/Query", post(query_handler))
        .route("/services/CTP/Md", post(market_data_handler))
        .route("/services/CTP/QueryLoginResponse", post(login_response_handler))
        .route(
            "/services/CTP/QuerySettlementResponse",
            post(settlement_response_handler),
        )
        .route("/services/CTP/SubmitOrder", post(submit_order_handler))
        .route("/services/CTP/CancelOrder", post(cancel_order_handler))
        .route("/services/CTP/RestartEngine", post(restart_engine_handler))
        .route("/channels/CTP/ZMQ", get(channel_handler))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

type ServiceResult<T> = Result<Json<T>, ServiceFailure>;

async fn query_handler(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<ServiceRequest>,
) -> ServiceResult<Value> {
    let outcome = state.gateway.query(request).await?;
    Ok(Json(json!(outcome)))
}

async fn market_data_handler(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<ServiceRequest>,
) -> ServiceResult<Value> {
    let outcome = state.gateway.market_data(request).await?;
    Ok(Json(json!(outcome)))
}

async fn login_response_handler(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<AccountRequest>,
) -> ServiceResult<Value> {
    let data = state.gateway.login_response(&request.account_id)?;
    Ok(Json(snapshot_body(data)))
}

async fn settlement_response_handler(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<AccountRequest>,
) -> ServiceResult<Value> {
    let data = state.gateway.settlement_response(&request.account_id)?;
    Ok(Json(snapshot_body(data)))
}

async fn submit_order_handler(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<SubmitOrderRequest>,
) -> ServiceResult<Value> {
    state.gateway.check_account(&request.account_id)?;
    let outcome = state.orders.submit_order(request.params).await?;
    Ok(Json(json!(outcome)))
}

async fn cancel_order_handler(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<CancelOrderRequest>,
) -> ServiceResult<Value> {
    state.gateway.check_account(&request.account_id)?;
    let outcome = state.orders.cancel_order(&request.exchange_order_id).await?;
    Ok(Json(json!(outcome)))
}

/// Queue a restart. Requests made while one is pending coalesce into it.
async fn restart_engine_handler(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<AccountRequest>,
) -> ServiceResult<Value> {
    state.gateway.check_account(&request.account_id)?;
    let queued = state.restart.request_restart(RestartReason::Manual);
    tracing::info!(account_id = %request.account_id, queued, "Manual engine restart requested");
    let outcome = if queued { "accepted" } else { "coalesced" };
    Ok(Json(snapshot_body(json!({ "restart": outcome }))))
}

async fn channel_handler(
    State(state): State<Arc<ServiceState>>,
    Query(query): Query<ChannelQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceFailure> {
    state.gateway.check_account(&query.account_id)?;
    tracing::info!(account_id = %query.account_id, "Frame channel subscriber attached");

    let stream = BroadcastStream::new(state.hub.subscribe_frames()).map(|item| {
        let event = match item {
            Ok(broadcast) => Event::default()
                .event("frame")
                .json_data(&*broadcast.frame)
                .unwrap_or_else(|e| Event::default().comment(e.to_string())),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Frame channel subscriber lagged");
                metrics::record_frame_dropped("lagged");
                Event::default().event("lagged").data(skipped.to_string())
            }
        };
        Ok::<_, Infallible>(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn snapshot_body(data: Value) -> Value {
    json!({ "res": { "code": 0, "message": "OK", "data": data } })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::services::{Correlator, GatewayConfig, SessionTracker, LOGIN_EVENT};
    use crate::domain::frame::{Frame, ResponseBody};
    use crate::infrastructure::broadcast::{BroadcastConfig, FrameHub};
    use crate::infrastructure::supervisor::{EngineCommand, EngineSupervisor, fast_backoff};
    use crate::infrastructure::transport::ChannelTransport;

    const ACCOUNT: &str = "9999/1001";

    struct NoRestart;

    impl RestartSignal for NoRestart {
        fn request_restart(&self, _reason: RestartReason) -> bool {
            false
        }
    }

    fn fixture(no_trade: bool) -> (Router, Arc<SessionTracker>) {
        fixture_with_restart(no_trade, Arc::new(NoRestart))
    }

    fn fixture_with_restart(
        no_trade: bool,
        restart: Arc<dyn RestartSignal>,
    ) -> (Router, Arc<SessionTracker>) {
        let (transport, _inbound, _peer) = ChannelTransport::pair(16);
        let correlator = Arc::new(Correlator::new(
            Arc::new(transport),
            Arc::new(NoRestart),
            Duration::from_millis(200),
        ));
        let session = Arc::new(SessionTracker::new());
        let gateway = Arc::new(Gateway::new(
            GatewayConfig {
                account_id: ACCOUNT.to_string(),
                tiers: HashMap::new(),
                no_trade,
            },
            correlator,
            session.subscribe(),
        ));
        let hub = Arc::new(FrameHub::new(ACCOUNT, BroadcastConfig::default()));
        let orders = Arc::new(OrderActions::new(
            Arc::clone(&gateway),
            hub.clone(),
            Duration::from_millis(200),
        ));
        let state = Arc::new(ServiceState::new(gateway, orders, hub, restart));
        (router(state), session)
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn fault_kinds_map_to_statuses() {
        assert_eq!(status_for(FaultKind::Readiness), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(FaultKind::Overflow), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(FaultKind::Rate), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(FaultKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(FaultKind::Routing), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(FaultKind::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_for(FaultKind::Protocol), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn query_before_settlement_is_not_ready() {
        let (app, _session) = fixture(false);
        let (status, body) = post_json(
            app,
            "/services/CTP/Query",
            json!({"account_id": ACCOUNT, "method": "ReqQryTradingAccount", "params": {}}),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["kind"], "readiness");
    }

    #[tokio::test]
    async fn foreign_account_is_rejected() {
        let (app, _session) = fixture(false);
        let (status, body) = post_json(
            app,
            "/services/CTP/Query",
            json!({"account_id": "9999/2002", "method": "ReqQryTradingAccount"}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "routing");
    }

    #[tokio::test]
    async fn market_data_rejects_query_methods() {
        let (app, _session) = fixture(false);
        let (status, body) = post_json(
            app,
            "/services/CTP/Md",
            json!({"account_id": ACCOUNT, "method": "ReqQryInstrument"}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "routing");
    }

    #[tokio::test]
    async fn login_response_after_login() {
        let (app, session) = fixture(false);
        let (status, _) = post_json(
            app.clone(),
            "/services/CTP/QueryLoginResponse",
            json!({"account_id": ACCOUNT}),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        session.observe(&Frame::response(
            0,
            ResponseBody::ok(
                LOGIN_EVENT,
                Some(json!({"BrokerID": "9999", "UserID": "1001", "FrontID": 1, "SessionID": 9})),
                true,
            ),
        ));

        let (status, body) = post_json(
            app,
            "/services/CTP/QueryLoginResponse",
            json!({"account_id": ACCOUNT}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["res"]["code"], 0);
        assert_eq!(body["res"]["message"], "OK");
        assert_eq!(body["res"]["data"]["SessionID"], 9);
    }

    #[tokio::test]
    async fn orders_are_forbidden_when_trading_disabled() {
        let (app, _session) = fixture(true);
        let (status, body) = post_json(
            app,
            "/services/CTP/SubmitOrder",
            json!({"account_id": ACCOUNT, "params": {"InstrumentID": "au2412"}}),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["kind"], "forbidden");
    }

    #[tokio::test]
    async fn malformed_cancel_id_is_a_routing_fault() {
        let (app, _session) = fixture(false);
        let (status, body) = post_json(
            app,
            "/services/CTP/CancelOrder",
            json!({"account_id": ACCOUNT, "exchange_order_id": "SHFE"}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "invalid request: exchange order id needed");
    }

    #[tokio::test]
    async fn rapid_restart_requests_coalesce() {
        let supervisor = EngineSupervisor::new(
            EngineCommand::new("ctp-engine"),
            fast_backoff(Duration::from_millis(10)),
        );
        let handle = supervisor.restart_handle();
        let (app, _session) = fixture_with_restart(false, Arc::new(handle.clone()));
        let body = json!({"account_id": ACCOUNT});

        let (status, first) =
            post_json(app.clone(), "/services/CTP/RestartEngine", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["res"]["data"]["restart"], "accepted");

        let (status, second) = post_json(app, "/services/CTP/RestartEngine", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["res"]["data"]["restart"], "coalesced");
        assert_eq!(handle.signal_count(), 2);
    }

    #[tokio::test]
    async fn restart_checks_account() {
        let (app, _session) = fixture(false);
        let (status, body) = post_json(
            app,
            "/services/CTP/RestartEngine",
            json!({"account_id": "9999/2002"}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "routing");
    }

    #[tokio::test]
    async fn frame_channel_checks_account() {
        let (app, _session) = fixture(false);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/channels/CTP/ZMQ?account_id=other")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
