//! Order Actions
//!
//! Order insertion and cancellation are answered on two paths: the counter
//! rejects a bad request through the request's own reply, while an accepted
//! request is reported through an unsolicited `OnRtnOrder`. Each action
//! races both paths under one shared deadline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use super::correlation::{CorrelationError, IdGenerator};
use super::gateway::{AdmittedCall, Gateway, GatewayError};
use crate::application::ports::{FrameBroadcast, FrameFeed};
use crate::domain::frame::Frame;
use crate::domain::session::LoginSnapshot;
use crate::domain::tier::ServiceTier;

/// Order return event name.
pub const ORDER_RETURN_EVENT: &str = "OnRtnOrder";

/// `OrderStatus` value of a cancelled order.
const ORDER_STATUS_CANCELLED: &str = "5";

/// `ActionFlag` value requesting deletion.
const ACTION_FLAG_DELETE: &str = "0";

/// Result of an order action.
#[derive(Debug, Clone, Serialize)]
pub struct OrderOutcome {
    /// `0` on acceptance, the engine code on rejection, `1` when the order
    /// return reports the order as cancelled.
    pub code: i32,
    /// `OK`, the engine message or the order's `StatusMsg`.
    pub message: String,
    /// Frame that decided the outcome.
    pub frame: Frame,
}

impl OrderOutcome {
    fn from_order_return(frame: &Frame) -> Self {
        let value = frame.value().cloned().unwrap_or_default();
        if is_cancelled(&value) {
            Self {
                code: 1,
                message: value
                    .get("StatusMsg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                frame: frame.clone(),
            }
        } else {
            Self {
                code: 0,
                message: "OK".to_string(),
                frame: frame.clone(),
            }
        }
    }

    fn from_reply(frame: Frame) -> Self {
        let (code, message) = frame
            .res
            .as_ref()
            .map(|res| (res.error_code, res.error_message.clone()))
            .unwrap_or_default();
        Self {
            code,
            message,
            frame,
        }
    }
}

fn is_cancelled(order: &Value) -> bool {
    match order.get("OrderStatus") {
        Some(Value::String(status)) => status == ORDER_STATUS_CANCELLED,
        // Character fields may arrive as their ASCII code.
        Some(Value::Number(n)) => n.as_u64() == Some(u64::from(b'5')),
        _ => false,
    }
}

fn text(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn number(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `EXCHANGE-ORDERSYSID`.
///
/// # Errors
///
/// Returns `GatewayError::InvalidInput` when either half is missing.
pub fn parse_exchange_order_id(id: &str) -> Result<(&str, &str), GatewayError> {
    match id.split_once('-') {
        Some((exchange, sys_id)) if !exchange.is_empty() && !sys_id.trim().is_empty() => {
            Ok((exchange, sys_id))
        }
        _ => Err(GatewayError::InvalidInput(
            "exchange order id needed".to_string(),
        )),
    }
}

/// Order submission and cancellation on the order tier.
pub struct OrderActions {
    gateway: Arc<Gateway>,
    feed: Arc<dyn FrameFeed>,
    order_refs: Mutex<IdGenerator>,
    timeout: Duration,
}

impl OrderActions {
    /// Order actions sharing `gateway`, waiting on `feed` for order returns.
    pub fn new(gateway: Arc<Gateway>, feed: Arc<dyn FrameFeed>, timeout: Duration) -> Self {
        Self {
            gateway,
            feed,
            order_refs: Mutex::new(IdGenerator::new()),
            timeout,
        }
    }

    /// Insert an order.
    ///
    /// `BrokerID`, `InvestorID` and a fresh `OrderRef` are filled in from the
    /// session; everything else in `params` is passed through.
    ///
    /// # Errors
    ///
    /// Fails on readiness, admission, send errors or when neither path
    /// answers before the deadline.
    pub async fn submit_order(&self, params: Value) -> Result<OrderOutcome, GatewayError> {
        let Value::Object(mut fields) = params else {
            return Err(GatewayError::InvalidInput(
                "order params must be an object".to_string(),
            ));
        };
        let login = self.session_login()?;
        let order_ref = self.order_refs.lock().advance().to_string();

        fields.insert("BrokerID".to_string(), json!(login.broker_id));
        fields.insert("InvestorID".to_string(), json!(login.investor_id));
        fields.insert("OrderRef".to_string(), json!(order_ref));

        let front_id = login.front_id;
        let session_id = login.session_id;
        let matches = move |order: &Value| {
            number(order, "FrontID") == Some(front_id)
                && number(order, "SessionID") == Some(session_id)
                && text(order, "OrderRef") == order_ref
        };

        self.race("SubmitOrder", "ReqOrderInsert", Value::Object(fields), matches)
            .await
    }

    /// Cancel an order identified as `EXCHANGE-ORDERSYSID`.
    ///
    /// # Errors
    ///
    /// Fails on a malformed id, readiness, admission, send errors or when
    /// neither path answers before the deadline.
    pub async fn cancel_order(&self, exchange_order_id: &str) -> Result<OrderOutcome, GatewayError> {
        let (exchange_id, order_sys_id) = parse_exchange_order_id(exchange_order_id)?;
        let login = self.session_login()?;

        let params = json!({
            "BrokerID": login.broker_id,
            "InvestorID": login.investor_id,
            "OrderActionRef": 0,
            "OrderRef": "",
            "RequestID": 0,
            "FrontID": login.front_id,
            "SessionID": login.session_id,
            "ExchangeID": exchange_id,
            "OrderSysID": order_sys_id,
            "ActionFlag": ACTION_FLAG_DELETE,
            "LimitPrice": 0,
            "VolumeChange": 0,
            "UserID": "",
            "InvestUnitID": "",
            "InstrumentID": "",
            "MacAddress": "",
            "IPAddress": "",
        });

        let exchange_id = exchange_id.trim().to_string();
        let order_sys_id = order_sys_id.trim().to_string();
        let matches = move |order: &Value| {
            text(order, "ExchangeID") == exchange_id && text(order, "OrderSysID") == order_sys_id
        };

        self.race("CancelOrder", "ReqOrderAction", params, matches)
            .await
    }

    fn session_login(&self) -> Result<LoginSnapshot, GatewayError> {
        if self.gateway.no_trade() {
            return Err(GatewayError::TradingDisabled);
        }
        let state = self.gateway.require(ServiceTier::OrderAction)?;
        state.login().cloned().ok_or(GatewayError::NotLoggedIn)
    }

    async fn race(
        &self,
        action: &'static str,
        method: &str,
        params: Value,
        matches: impl Fn(&Value) -> bool + Send + Sync,
    ) -> Result<OrderOutcome, GatewayError> {
        // Subscribe before sending so the order return cannot be missed.
        let mut returns = self.feed.subscribe();
        let deadline = Instant::now() + self.timeout;
        let mut call = self
            .gateway
            .open(ServiceTier::OrderAction, method, params)
            .await?;
        tracing::info!(action, request_id = call.request_id(), "Order action sent");

        let result = wait_first(&mut returns, &mut call, deadline, &matches).await;
        match &result {
            Ok(Some(outcome)) => {
                tracing::info!(action, code = outcome.code, message = %outcome.message, "Order action answered");
            }
            Ok(None) => tracing::warn!(action, "Order action timed out"),
            Err(e) => tracing::warn!(action, error = %e, "Order action failed"),
        }
        result?.ok_or(GatewayError::OrderTimeout {
            action,
            timeout: self.timeout,
        })
    }
}

/// First answer from either path, `None` once `deadline` passes.
async fn wait_first(
    returns: &mut broadcast::Receiver<FrameBroadcast>,
    call: &mut AdmittedCall,
    deadline: Instant,
    matches: &(impl Fn(&Value) -> bool + Send + Sync),
) -> Result<Option<OrderOutcome>, GatewayError> {
    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);
    let mut reply_open = true;

    loop {
        tokio::select! {
            () = &mut expired => return Ok(None),
            received = returns.recv() => match received {
                Ok(broadcast) => {
                    let frame = &broadcast.frame;
                    if frame.event() == Some(ORDER_RETURN_EVENT)
                        && frame.value().is_some_and(|v| matches(v))
                    {
                        return Ok(Some(OrderOutcome::from_order_return(frame)));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Order return receiver lagged");
                }
                Err(RecvError::Closed) => return Err(GatewayError::FeedClosed),
            },
            reply = call.next(), if reply_open => match reply {
                Some(Ok(frame)) => {
                    if frame.res.as_ref().is_some_and(|res| res.error_code != 0) {
                        return Ok(Some(OrderOutcome::from_reply(frame)));
                    }
                    reply_open = !frame.is_last();
                }
                // The shared deadline decides the timeout.
                Some(Err(CorrelationError::Timeout { .. })) | None => reply_open = false,
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

impl std::fmt::Debug for OrderActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderActions")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
