//! Strategy-level configuration: symbols, capital, leverage, LLM wiring.

use anyhow::{Context, Result};

use crate::domain::request::{LlmModelConfig, LlmProvider, TradingConfig};

impl std::str::FromStr for LlmProvider {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            "gemini" => Ok(LlmProvider::Gemini),
            other => anyhow::bail!("unknown LLM provider: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub trading: TradingConfig,
    pub llm: Option<LlmModelConfig>,
}

impl StrategyConfig {
    pub fn from_env() -> Result<Self> {
        let symbols: Vec<String> = std::env::var("STRATEGY_SYMBOLS")
            .context("STRATEGY_SYMBOLS not set")?
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        anyhow::ensure!(!symbols.is_empty(), "STRATEGY_SYMBOLS must name at least one symbol");

        let trading = TradingConfig {
            strategy_name: std::env::var("STRATEGY_NAME").unwrap_or_else(|_| "unnamed-strategy".to_string()),
            symbols,
            initial_capital: std::env::var("INITIAL_CAPITAL").ok().and_then(|v| v.parse().ok()).unwrap_or(1000.0),
            max_leverage: std::env::var("MAX_LEVERAGE").ok().and_then(|v| v.parse().ok()),
            max_positions: std::env::var("MAX_POSITIONS").ok().and_then(|v| v.parse().ok()),
            decide_interval_secs: std::env::var("DECIDE_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            custom_prompt: std::env::var("STRATEGY_CUSTOM_PROMPT").ok(),
            prompt_text: std::env::var("STRATEGY_PROMPT_TEXT").ok(),
        };

        let llm = match std::env::var("LLM_PROVIDER").ok() {
            Some(provider_str) => Some(LlmModelConfig {
                provider: provider_str.parse()?,
                model_id: std::env::var("LLM_MODEL_ID").context("LLM_MODEL_ID not set but LLM_PROVIDER is")?,
                api_key: std::env::var("LLM_API_KEY").ok(),
            }),
            None => None,
        };

        Ok(Self { trading, llm })
    }
}
