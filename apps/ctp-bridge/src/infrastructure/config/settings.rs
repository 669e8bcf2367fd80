//! Bridge Configuration Settings
//!
//! Configuration types for the bridge, loaded from environment variables.
//! Parsing goes through a lookup function so tests never touch the process
//! environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::{DEFAULT_REQUEST_TIMEOUT, GatewayConfig, LivenessConfig, TierLimits};
use crate::domain::tier::ServiceTier;
use crate::infrastructure::broadcast::{BroadcastConfig, DEFAULT_CAPACITY};
use crate::infrastructure::supervisor::{BackoffConfig, EngineCommand, EngineVariant};
use crate::infrastructure::transport::{DEFAULT_PULL_ENDPOINT, DEFAULT_PUSH_ENDPOINT, ZmqConfig};

/// Engine login credentials and front addresses.
///
/// The engine reads these from its inherited environment; the bridge only
/// checks they are present.
#[derive(Clone)]
pub struct EngineCredentials {
    broker_id: String,
    user_id: String,
    password: String,
    app_id: String,
    auth_code: String,
    trader_addr: String,
    market_addr: String,
}

impl EngineCredentials {
    /// Broker id.
    #[must_use]
    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    /// User id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// App id.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Trading front address.
    #[must_use]
    pub fn trader_addr(&self) -> &str {
        &self.trader_addr
    }

    /// Market data front address.
    #[must_use]
    pub fn market_addr(&self) -> &str {
        &self.market_addr
    }

    /// Password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Authentication code.
    #[must_use]
    pub fn auth_code(&self) -> &str {
        &self.auth_code
    }
}

impl std::fmt::Debug for EngineCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCredentials")
            .field("broker_id", &self.broker_id)
            .field("user_id", &self.user_id)
            .field("app_id", &self.app_id)
            .field("trader_addr", &self.trader_addr)
            .field("market_addr", &self.market_addr)
            .field("password", &"[REDACTED]")
            .field("auth_code", &"[REDACTED]")
            .finish()
    }
}

/// Per-tier admission settings.
#[derive(Debug, Clone, Copy)]
pub struct TierSettings {
    /// Query tier.
    pub query: TierLimits,
    /// Order tier.
    pub order: TierLimits,
    /// Market-data tier.
    pub market_data: TierLimits,
}

impl Default for TierSettings {
    fn default() -> Self {
        let query = TierLimits {
            max_concurrent: 1,
            rate_per_sec: 1,
            backlog_multiplier: 60,
        };
        Self {
            query,
            order: TierLimits {
                rate_per_sec: 100,
                ..query
            },
            market_data: query,
        }
    }
}

impl TierSettings {
    /// Limits keyed by tier.
    #[must_use]
    pub fn by_tier(&self) -> HashMap<ServiceTier, TierLimits> {
        HashMap::from([
            (ServiceTier::Query, self.query),
            (ServiceTier::OrderAction, self.order),
            (ServiceTier::MarketData, self.market_data),
        ])
    }
}

/// Engine process settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deployment variant.
    pub variant: EngineVariant,
    /// Directory holding the engine binaries.
    pub home: PathBuf,
    /// Explicit binary path, overriding the variant.
    pub binary: Option<PathBuf>,
    /// Restart backoff.
    pub backoff: BackoffConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            variant: EngineVariant::default(),
            home: PathBuf::from("./build"),
            binary: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl EngineSettings {
    /// Command launching the engine.
    #[must_use]
    pub fn command(&self) -> EngineCommand {
        self.binary.as_ref().map_or_else(
            || EngineCommand::for_variant(&self.home, self.variant),
            EngineCommand::new,
        )
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Service surface HTTP port.
    pub service_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            service_port: 8090,
            health_port: 8091,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Engine credentials.
    pub credentials: EngineCredentials,
    /// Terminal identity used in logs and health.
    pub terminal_id: String,
    /// Reject order actions.
    pub no_trade: bool,
    /// Socket endpoints.
    pub transport: ZmqConfig,
    /// Tier admission limits.
    pub tiers: TierSettings,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Engine process settings.
    pub engine: EngineSettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Frame channel settings.
    pub broadcast: BroadcastConfig,
    /// Liveness probe settings.
    pub liveness: LivenessConfig,
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or empty, or the
    /// engine variant is unknown.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let credentials = EngineCredentials {
            broker_id: env.required("BROKER_ID")?,
            user_id: env.required("USER_ID")?,
            password: env.required("PASSWORD")?,
            app_id: env.required("APP_ID")?,
            auth_code: env.required("AUTH_CODE")?,
            trader_addr: env.required("TRADER_ADDR")?,
            market_addr: env.required("MARKET_ADDR")?,
        };
        let account_id = format!("{}/{}", credentials.broker_id, credentials.user_id);

        let terminal_id = env
            .get("TERMINAL_ID")
            .unwrap_or_else(|| format!("CTP/{account_id}"));
        let no_trade = env.get("NO_TRADE").is_some_and(|v| parse_bool(&v));

        let transport_defaults = ZmqConfig::default();
        let transport = ZmqConfig {
            push_endpoint: env
                .get("ZMQ_PUSH_URL")
                .unwrap_or_else(|| DEFAULT_PUSH_ENDPOINT.to_string()),
            pull_endpoint: env
                .get("ZMQ_PULL_URL")
                .unwrap_or_else(|| DEFAULT_PULL_ENDPOINT.to_string()),
            ..transport_defaults
        };

        let defaults = TierSettings::default();
        let query = env.tier("QUERY", defaults.query);
        let tiers = TierSettings {
            query,
            order: env.tier("ORDER", defaults.order),
            // Market data falls back to the query values.
            market_data: env.tier("MD", query),
        };

        let variant = match env.get("CTP_VARIANT") {
            Some(value) => {
                EngineVariant::parse(&value).ok_or(ConfigError::InvalidValue {
                    key: "CTP_VARIANT".to_string(),
                    value,
                })?
            }
            None => EngineVariant::default(),
        };
        let backoff_defaults = BackoffConfig::default();
        let engine = EngineSettings {
            variant,
            home: env
                .get("CTP_BRIDGE_HOME")
                .map_or_else(|| EngineSettings::default().home, PathBuf::from),
            binary: env.get("CTP_BRIDGE_BINARY").map(PathBuf::from),
            backoff: BackoffConfig {
                initial_delay: env.millis(
                    "CTP_RESTART_BACKOFF_INITIAL_MS",
                    backoff_defaults.initial_delay,
                ),
                max_delay: env.secs("CTP_RESTART_BACKOFF_MAX_SECS", backoff_defaults.max_delay),
                stable_run: env.secs("CTP_STABLE_RUN_SECS", backoff_defaults.stable_run),
                ..backoff_defaults
            },
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            service_port: env.parse("CTP_BRIDGE_SERVICE_PORT", server_defaults.service_port),
            health_port: env.parse("CTP_BRIDGE_HEALTH_PORT", server_defaults.health_port),
        };

        let liveness_defaults = LivenessConfig::default();
        let liveness = LivenessConfig {
            method: env
                .get("LIVENESS_PING_METHOD")
                .unwrap_or(liveness_defaults.method),
            timeout: env.millis("LIVENESS_TIMEOUT_MS", liveness_defaults.timeout),
            attempts: env.parse("LIVENESS_ATTEMPTS", liveness_defaults.attempts),
        };

        Ok(Self {
            credentials,
            terminal_id,
            no_trade,
            transport,
            tiers,
            request_timeout: env.millis("CTP_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT),
            engine,
            server,
            broadcast: BroadcastConfig {
                capacity: env.parse("CTP_BROADCAST_CAPACITY", DEFAULT_CAPACITY),
            },
            liveness,
        })
    }

    /// Account id, `BROKER_ID/USER_ID`.
    #[must_use]
    pub fn account_id(&self) -> String {
        format!(
            "{}/{}",
            self.credentials.broker_id, self.credentials.user_id
        )
    }

    /// Gateway configuration.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            account_id: self.account_id(),
            tiers: self.tiers.by_tier(),
            no_trade: self.no_trade,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value that is not allowed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

/// Typed accessors over a lookup function.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v),
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn tier(&self, prefix: &str, default: TierLimits) -> TierLimits {
        TierLimits {
            max_concurrent: self
                .parse(&format!("{prefix}_IN_PROCESSING_LIMIT"), default.max_concurrent)
                .max(1),
            rate_per_sec: self
                .parse(&format!("{prefix}_RPS_LIMIT"), default.rate_per_sec)
                .max(1),
            backlog_multiplier: self
                .parse(
                    &format!("{prefix}_BACKLOG_MULTIPLIER"),
                    default.backlog_multiplier,
                )
                .max(1),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
