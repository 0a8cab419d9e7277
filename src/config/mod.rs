//! Configuration, split by concern. Each sub-module
//! reads `std::env::var` directly via its own `from_env()`; `dotenvy` is
//! expected to have already populated the process environment by the time
//! any of these run (see `infrastructure::env::load_dotenv`).

pub mod broker_config;
pub mod observability_config;
pub mod risk_env_config;
pub mod strategy_config;

pub use broker_config::BrokerConfig;
pub use observability_config::ObservabilityConfig;
pub use risk_env_config::{PersistenceConfig, RiskEnvConfig};
pub use strategy_config::StrategyConfig;

use anyhow::Result;

/// Every config sub-module loaded together, the shape `main.rs` wires up at
/// startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub broker: BrokerConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskEnvConfig,
    pub persistence: PersistenceConfig,
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            broker: BrokerConfig::from_env()?,
            strategy: StrategyConfig::from_env()?,
            risk: RiskEnvConfig::from_env()?,
            persistence: PersistenceConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
        })
    }
}
