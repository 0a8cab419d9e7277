//! Strategy request configuration: the immutable parameters a strategy is
//! created with. Reconstructed from the persisted `strategies.config` JSON
//! column on auto-resume.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::types::{MarginMode, MarketType, TradingMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub exchange_id: String,
    pub trading_mode: TradingMode,
    pub market_type: MarketType,
    pub margin_mode: MarginMode,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub passphrase: Option<String>,
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub strategy_name: String,
    pub symbols: Vec<String>,
    pub initial_capital: f64,
    pub max_leverage: Option<f64>,
    pub max_positions: Option<u32>,
    pub decide_interval_secs: u64,
    pub custom_prompt: Option<String>,
    pub prompt_text: Option<String>,
}

impl TradingConfig {
    /// Symbols are always stored upper-cased; callers may pass any case.
    pub fn normalized_symbols(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.to_uppercase()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModelConfig {
    pub provider: LlmProvider,
    pub model_id: String,
    pub api_key: Option<String>,
}

/// Full request used to construct a strategy runtime. Either fresh (strategy
/// creation) or reconstructed from persisted config (auto-resume).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    pub exchange_config: ExchangeConfig,
    pub trading_config: TradingConfig,
    pub llm_model_config: Option<LlmModelConfig>,
}

impl UserRequest {
    /// `max_leverage <= 1.0` implies spot; anything above implies a
    /// perpetual/futures market. Mirrors the original request validator.
    pub fn infer_market_type(max_leverage: Option<f64>) -> MarketType {
        match max_leverage {
            Some(lev) if lev > 1.0 => MarketType::Swap,
            _ => MarketType::Spot,
        }
    }

    pub fn max_leverage_decimal(&self) -> Decimal {
        Decimal::try_from(self.trading_config.max_leverage.unwrap_or(1.0)).unwrap_or(Decimal::ONE)
    }
}
