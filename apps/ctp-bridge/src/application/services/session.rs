//! Session Tracker
//!
//! Single owner of the engine `SessionState`. The frame router feeds it every
//! inbound frame; everyone else reads snapshots through a `watch` receiver.

use tokio::sync::watch;

use crate::domain::frame::Frame;
use crate::domain::session::{LoginSnapshot, SessionState, SettlementSnapshot};
use crate::infrastructure::metrics;

/// Login callback event name.
pub const LOGIN_EVENT: &str = "OnRspUserLogin";

/// Settlement confirmation callback event name.
pub const SETTLEMENT_EVENT: &str = "OnRspSettlementInfoConfirm";

/// Session state machine driven by unsolicited engine events.
#[derive(Debug)]
pub struct SessionTracker {
    state: watch::Sender<SessionState>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    /// Tracker in `NotConnected`.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::NotConnected);
        Self { state }
    }

    /// Receiver of state snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Feed one inbound frame. Returns `true` if the state changed.
    ///
    /// Only the first successful login per engine lifetime is captured, and a
    /// settlement confirmation is only accepted after login.
    pub fn observe(&self, frame: &Frame) -> bool {
        let Some(res) = frame.res.as_ref() else {
            return false;
        };
        if res.error_code != 0 {
            return false;
        }
        let value = res.value.clone().unwrap_or_default();

        let changed = self.state.send_if_modified(|state| match (res.event.as_str(), &*state) {
            (LOGIN_EVENT, SessionState::NotConnected) => {
                let login = LoginSnapshot::from_value(&value);
                tracing::info!(
                    broker_id = %login.broker_id,
                    investor_id = %login.investor_id,
                    front_id = login.front_id,
                    session_id = login.session_id,
                    "CTP logged in"
                );
                *state = SessionState::LoggedIn(login);
                true
            }
            (SETTLEMENT_EVENT, SessionState::LoggedIn(login)) => {
                tracing::info!("CTP settlement confirmed");
                *state = SessionState::SettlementConfirmed {
                    login: login.clone(),
                    settlement: SettlementSnapshot::from_value(&value),
                };
                true
            }
            (SETTLEMENT_EVENT, SessionState::NotConnected) => {
                tracing::warn!("Ignoring settlement confirmation before login");
                false
            }
            _ => false,
        });

        if changed {
            metrics::set_session_state(self.state.borrow().level());
        }
        changed
    }

    /// Return to `NotConnected`; called whenever the engine process changes.
    pub fn reset(&self) {
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, SessionState::NotConnected) {
                false
            } else {
                *state = SessionState::NotConnected;
                true
            }
        });
        if changed {
            tracing::info!("Session reset to not connected");
            metrics::set_session_state(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::frame::ResponseBody;
    use crate::domain::session::Readiness;

    fn event(name: &str, code: i32, value: serde_json::Value) -> Frame {
        Frame::response(
            0,
            ResponseBody {
                error_code: code,
                error_message: String::new(),
                event: name.to_string(),
                value: Some(value),
                is_last: true,
            },
        )
    }

    fn login_frame(session_id: i64) -> Frame {
        event(
            LOGIN_EVENT,
            0,
            json!({"BrokerID": "9999", "UserID": "1001", "FrontID": 1, "SessionID": session_id}),
        )
    }

    #[test]
    fn login_then_settlement() {
        let tracker = SessionTracker::new();
        let rx = tracker.subscribe();

        assert!(tracker.observe(&login_frame(42)));
        assert!(rx.borrow().satisfies(Readiness::LoggedIn));

        assert!(tracker.observe(&event(SETTLEMENT_EVENT, 0, json!({"ConfirmDate": "20240105"}))));
        let state = tracker.snapshot();
        assert!(state.satisfies(Readiness::SettlementConfirmed));
        assert_eq!(state.login().map(|l| l.session_id), Some(42));
    }

    #[test]
    fn only_first_login_is_captured() {
        let tracker = SessionTracker::new();
        assert!(tracker.observe(&login_frame(1)));
        assert!(!tracker.observe(&login_frame(2)));
        assert_eq!(tracker.snapshot().login().map(|l| l.session_id), Some(1));
    }

    #[test]
    fn settlement_before_login_is_ignored() {
        let tracker = SessionTracker::new();
        assert!(!tracker.observe(&event(SETTLEMENT_EVENT, 0, json!({}))));
        assert_eq!(tracker.snapshot(), SessionState::NotConnected);
    }

    #[test]
    fn failed_login_is_ignored() {
        let tracker = SessionTracker::new();
        assert!(!tracker.observe(&event(LOGIN_EVENT, 3, json!({}))));
        assert_eq!(tracker.snapshot(), SessionState::NotConnected);
    }

    #[test]
    fn reset_allows_new_login() {
        let tracker = SessionTracker::new();
        tracker.observe(&login_frame(1));
        tracker.observe(&event(SETTLEMENT_EVENT, 0, json!({})));

        tracker.reset();
        assert_eq!(tracker.snapshot(), SessionState::NotConnected);

        assert!(tracker.observe(&login_frame(7)));
        assert_eq!(tracker.snapshot().login().map(|l| l.session_id), Some(7));
    }
}
