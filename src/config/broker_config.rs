//! Exchange/broker credentials and mode, read from the process environment.
//! Parsed with small `FromStr` impls rather than a
//! generic deserializer, matching how the rest of the config module reads
//! `std::env::var` directly.

use std::str::FromStr;

use anyhow::{Context, Result};

use crate::domain::types::{MarginMode, MarketType, TradingMode};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub exchange_id: String,
    pub trading_mode: TradingMode,
    pub market_type: MarketType,
    pub margin_mode: MarginMode,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub passphrase: Option<String>,
    pub testnet: bool,
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "LIVE" => Ok(TradingMode::Live),
            "VIRTUAL" | "PAPER" => Ok(TradingMode::Virtual),
            other => anyhow::bail!("unknown trading mode: {other}"),
        }
    }
}

impl FromStr for MarketType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SPOT" => Ok(MarketType::Spot),
            "SWAP" => Ok(MarketType::Swap),
            "FUTURE" => Ok(MarketType::Future),
            other => anyhow::bail!("unknown market type: {other}"),
        }
    }
}

impl FromStr for MarginMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ISOLATED" => Ok(MarginMode::Isolated),
            "CROSS" => Ok(MarginMode::Cross),
            other => anyhow::bail!("unknown margin mode: {other}"),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let exchange_id = std::env::var("EXCHANGE_ID").context("EXCHANGE_ID not set")?;
        let trading_mode = std::env::var("TRADING_MODE").unwrap_or_else(|_| "VIRTUAL".to_string()).parse()?;
        let market_type = std::env::var("MARKET_TYPE").unwrap_or_else(|_| "SPOT".to_string()).parse()?;
        let margin_mode = std::env::var("MARGIN_MODE").unwrap_or_else(|_| "CROSS".to_string()).parse()?;
        Ok(Self {
            exchange_id,
            trading_mode,
            market_type,
            margin_mode,
            api_key: std::env::var("EXCHANGE_API_KEY").ok(),
            secret_key: std::env::var("EXCHANGE_SECRET_KEY").ok(),
            passphrase: std::env::var("EXCHANGE_PASSPHRASE").ok(),
            testnet: std::env::var("EXCHANGE_TESTNET").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false),
        })
    }

    pub fn into_exchange_config(self) -> crate::domain::request::ExchangeConfig {
        crate::domain::request::ExchangeConfig {
            exchange_id: self.exchange_id,
            trading_mode: self.trading_mode,
            market_type: self.market_type,
            margin_mode: self.margin_mode,
            api_key: self.api_key,
            secret_key: self.secret_key,
            passphrase: self.passphrase,
            testnet: self.testnet,
        }
    }
}
