//! Service Tiers
//!
//! Every native method belongs to exactly one tier, decided by its name
//! alone:
//!
//! | Tier | Method prefix | Requires |
//! |------|---------------|----------|
//! | `Query` | `ReqQry` | settlement confirmed |
//! | `OrderAction` | `ReqOrder` | settlement confirmed |
//! | `MarketData` | `ReqUser`, `Subscribe`, `UnSubscribe` | logged in |

use std::fmt;

use serde::Serialize;

use super::session::Readiness;

/// Independently throttled service class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    /// Account, position, order and trade queries.
    Query,
    /// Order insertion and cancellation.
    OrderAction,
    /// Session bootstrap and market-data subscription control.
    MarketData,
}

const QUERY_PREFIXES: &[&str] = &["ReqQry"];
const ORDER_PREFIXES: &[&str] = &["ReqOrder"];
const MARKET_DATA_PREFIXES: &[&str] = &["ReqUser", "Subscribe", "UnSubscribe"];

impl ServiceTier {
    /// All tiers, in a stable order.
    pub const ALL: [Self; 3] = [Self::Query, Self::OrderAction, Self::MarketData];

    /// Route a method name to its tier.
    ///
    /// Returns `None` for methods outside every tier's name class.
    #[must_use]
    pub fn classify(method: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.prefixes().iter().any(|p| method.starts_with(p)))
    }

    /// Whether `method` belongs to this tier.
    #[must_use]
    pub fn accepts(self, method: &str) -> bool {
        Self::classify(method) == Some(self)
    }

    /// Session readiness required before a call is admitted.
    #[must_use]
    pub const fn required_readiness(self) -> Readiness {
        match self {
            Self::Query | Self::OrderAction => Readiness::SettlementConfirmed,
            Self::MarketData => Readiness::LoggedIn,
        }
    }

    /// Metric / log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::OrderAction => "order_action",
            Self::MarketData => "market_data",
        }
    }

    const fn prefixes(self) -> &'static [&'static str] {
        match self {
            Self::Query => QUERY_PREFIXES,
            Self::OrderAction => ORDER_PREFIXES,
            Self::MarketData => MARKET_DATA_PREFIXES,
        }
    }
}

impl fmt::Display for ServiceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
