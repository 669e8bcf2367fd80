//! Configuration Module
//!
//! Configuration loading for the bridge process.

mod settings;

pub use settings::{
    BridgeConfig, ConfigError, EngineCredentials, EngineSettings, ServerSettings, TierSettings,
};
