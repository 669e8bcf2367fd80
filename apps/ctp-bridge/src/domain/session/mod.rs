//! Engine Session State
//!
//! The native engine authenticates itself on every launch and must then
//! acknowledge the day's settlement before queries or orders are accepted.
//! This module models that lifecycle as a one-way state machine:
//!
//! ```text
//! NotConnected ──OnRspUserLogin──► LoggedIn ──OnRspSettlementInfoConfirm──► SettlementConfirmed
//!       ▲                                                                          │
//!       └──────────────────────────── engine restart ─────────────────────────────┘
//! ```
//!
//! The types here hold no I/O; transitions are driven by the session tracker
//! in the application layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

// =============================================================================
// Snapshots
// =============================================================================

/// Captured `OnRspUserLogin` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginSnapshot {
    /// Broker id (`BrokerID`).
    pub broker_id: String,
    /// Investor / user id (`UserID`).
    pub investor_id: String,
    /// Front id assigned to this session (`FrontID`).
    pub front_id: i64,
    /// Session id assigned to this session (`SessionID`).
    pub session_id: i64,
    /// Trading day reported by the counter (`TradingDay`), if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trading_day: Option<String>,
    /// Full login payload as delivered by the engine.
    pub raw: Value,
    /// When the login event was observed.
    pub observed_at: DateTime<Utc>,
}

impl LoginSnapshot {
    /// Extract a snapshot from an `OnRspUserLogin` value.
    ///
    /// Missing identity fields default to empty / zero; the engine always
    /// populates them on a successful login.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        Self {
            broker_id: string_field(value, "BrokerID"),
            investor_id: string_field(value, "UserID"),
            front_id: int_field(value, "FrontID"),
            session_id: int_field(value, "SessionID"),
            trading_day: value
                .get("TradingDay")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: value.clone(),
            observed_at: Utc::now(),
        }
    }
}

/// Captured `OnRspSettlementInfoConfirm` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementSnapshot {
    /// Full confirmation payload as delivered by the engine.
    pub raw: Value,
    /// When the confirmation was observed.
    pub observed_at: DateTime<Utc>,
}

impl SettlementSnapshot {
    /// Wrap a confirmation payload.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        Self {
            raw: value.clone(),
            observed_at: Utc::now(),
        }
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn int_field(value: &Value, key: &str) -> i64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Current engine session state.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionState {
    /// No login observed since the engine (re)started.
    #[default]
    NotConnected,
    /// Logged in, settlement not yet confirmed.
    LoggedIn(LoginSnapshot),
    /// Logged in and settlement confirmed; all tiers are open.
    SettlementConfirmed {
        /// Login snapshot captured earlier in this engine lifetime.
        login: LoginSnapshot,
        /// Settlement confirmation snapshot.
        settlement: SettlementSnapshot,
    },
}

impl SessionState {
    /// Login snapshot, once logged in.
    #[must_use]
    pub const fn login(&self) -> Option<&LoginSnapshot> {
        match self {
            Self::NotConnected => None,
            Self::LoggedIn(login) | Self::SettlementConfirmed { login, .. } => Some(login),
        }
    }

    /// Settlement snapshot, once confirmed.
    #[must_use]
    pub const fn settlement(&self) -> Option<&SettlementSnapshot> {
        match self {
            Self::SettlementConfirmed { settlement, .. } => Some(settlement),
            _ => None,
        }
    }

    /// Highest readiness level reached, if any.
    #[must_use]
    pub const fn readiness(&self) -> Option<Readiness> {
        match self {
            Self::NotConnected => None,
            Self::LoggedIn(_) => Some(Readiness::LoggedIn),
            Self::SettlementConfirmed { .. } => Some(Readiness::SettlementConfirmed),
        }
    }

    /// Whether this state satisfies `required`.
    #[must_use]
    pub fn satisfies(&self, required: Readiness) -> bool {
        self.readiness().is_some_and(|reached| reached >= required)
    }

    /// Short label for logs and health reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::LoggedIn(_) => "logged_in",
            Self::SettlementConfirmed { .. } => "settlement_confirmed",
        }
    }

    /// Numeric level exported as the session gauge.
    #[must_use]
    pub const fn level(&self) -> u8 {
        match self {
            Self::NotConnected => 0,
            Self::LoggedIn(_) => 1,
            Self::SettlementConfirmed { .. } => 2,
        }
    }
}

/// Readiness level a call requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// `OnRspUserLogin` observed.
    LoggedIn,
    /// `OnRspSettlementInfoConfirm` observed after login.
    SettlementConfirmed,
}

impl Readiness {
    /// Short label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoggedIn => "logged_in",
            Self::SettlementConfirmed => "settlement_confirmed",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn login() -> LoginSnapshot {
        LoginSnapshot::from_value(&json!({
            "BrokerID": "9999",
            "UserID": "1001",
            "FrontID": 3,
            "SessionID": "-177",
            "TradingDay": "20240105",
        }))
    }

    #[test]
    fn login_snapshot_extracts_identity() {
        let snapshot = login();
        assert_eq!(snapshot.broker_id, "9999");
        assert_eq!(snapshot.investor_id, "1001");
        assert_eq!(snapshot.front_id, 3);
        assert_eq!(snapshot.session_id, -177);
        assert_eq!(snapshot.trading_day.as_deref(), Some("20240105"));
    }

    #[test]
    fn login_snapshot_tolerates_missing_fields() {
        let snapshot = LoginSnapshot::from_value(&json!({}));
        assert_eq!(snapshot.broker_id, "");
        assert_eq!(snapshot.front_id, 0);
        assert!(snapshot.trading_day.is_none());
    }

    #[test]
    fn readiness_ordering() {
        let not_connected = SessionState::NotConnected;
        assert!(!not_connected.satisfies(Readiness::LoggedIn));
        assert!(!not_connected.satisfies(Readiness::SettlementConfirmed));

        let logged_in = SessionState::LoggedIn(login());
        assert!(logged_in.satisfies(Readiness::LoggedIn));
        assert!(!logged_in.satisfies(Readiness::SettlementConfirmed));
        assert!(logged_in.settlement().is_none());

        let confirmed = SessionState::SettlementConfirmed {
            login: login(),
            settlement: SettlementSnapshot::from_value(&json!({"ConfirmDate": "20240105"})),
        };
        assert!(confirmed.satisfies(Readiness::LoggedIn));
        assert!(confirmed.satisfies(Readiness::SettlementConfirmed));
        assert_eq!(confirmed.login().map(|l| l.front_id), Some(3));
        assert_eq!(confirmed.level(), 2);
        assert_eq!(confirmed.as_str(), "settlement_confirmed");
    }
}
