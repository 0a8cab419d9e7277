//! Risk/guardrail tuning knobs, with defaults matching the reference
//! composer's hand-tuned constants.

use anyhow::Result;

use crate::application::composer::guardrails::GuardrailParams;

#[derive(Debug, Clone)]
pub struct RiskEnvConfig {
    pub default_slippage_bps: u32,
    pub cap_factor: f64,
    pub quantity_precision: f64,
}

impl RiskEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            default_slippage_bps: std::env::var("RISK_DEFAULT_SLIPPAGE_BPS").ok().and_then(|v| v.parse().ok()).unwrap_or(25),
            cap_factor: std::env::var("RISK_CAP_FACTOR").ok().and_then(|v| v.parse().ok()).unwrap_or(1.5),
            quantity_precision: std::env::var("RISK_QUANTITY_PRECISION").ok().and_then(|v| v.parse().ok()).unwrap_or(1e-9),
        })
    }

    pub fn to_guardrail_params(&self) -> GuardrailParams {
        GuardrailParams {
            default_slippage_bps: self.default_slippage_bps,
            quantity_precision: rust_decimal::Decimal::try_from(self.quantity_precision).unwrap_or(rust_decimal::Decimal::new(1, 9)),
            cap_factor: rust_decimal::Decimal::try_from(self.cap_factor).unwrap_or(rust_decimal::Decimal::new(15, 1)),
        }
    }
}

/// Persistence connection settings. Kept alongside risk config rather than
/// as its own file since it's a small, newer concern grafted onto the
/// existing per-concern config split.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub database_url: String,
}

impl PersistenceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://strategy-engine.db".to_string()),
        })
    }
}
