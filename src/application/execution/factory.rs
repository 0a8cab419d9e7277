//! Resolves an `ExchangeConfig` into a concrete `ExecutionGateway`.
//! `TradingMode::Virtual` always gets the paper
//! gateway regardless of venue; `TradingMode::Live` resolves a `VenueProfile`
//! by `exchange_id` and fails fast with a typed `InitError` rather than
//! falling through to paper trading silently.

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::application::execution::paper::PaperExecutionGateway;
use crate::application::execution::venue::{VenueExecutionGateway, VenueProfile};
use crate::domain::errors::InitError;
use crate::domain::ports::ExecutionGateway;
use crate::domain::request::ExchangeConfig;
use crate::domain::types::TradingMode;

const PAPER_FEE_BPS: i64 = 10;

pub fn create_execution_gateway(config: &ExchangeConfig) -> Result<Arc<dyn ExecutionGateway>, InitError> {
    match config.trading_mode {
        TradingMode::Virtual => Ok(Arc::new(PaperExecutionGateway::new(Decimal::new(PAPER_FEE_BPS, 0)))),
        TradingMode::Live => {
            let profile = resolve_profile(&config.exchange_id)?;
            let gateway = VenueExecutionGateway::new(profile, config.clone())?;
            Ok(Arc::new(gateway))
        }
    }
}

fn resolve_profile(exchange_id: &str) -> Result<VenueProfile, InitError> {
    match exchange_id.to_lowercase().as_str() {
        "binance" | "binanceusdm" => Ok(VenueProfile::binance()),
        "okx" => Ok(VenueProfile::okx()),
        "hyperliquid" => Ok(VenueProfile::hyperliquid()),
        other => Err(InitError::UnknownVenue { venue: other.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{MarginMode, MarketType};

    fn base_config(trading_mode: TradingMode) -> ExchangeConfig {
        ExchangeConfig {
            exchange_id: "binance".to_string(),
            trading_mode,
            market_type: MarketType::Swap,
            margin_mode: MarginMode::Cross,
            api_key: None,
            secret_key: None,
            passphrase: None,
            testnet: false,
        }
    }

    #[test]
    fn virtual_mode_never_needs_credentials() {
        let gw = create_execution_gateway(&base_config(TradingMode::Virtual));
        assert!(gw.is_ok());
    }

    #[test]
    fn live_mode_without_credentials_fails_fast() {
        let err = create_execution_gateway(&base_config(TradingMode::Live)).unwrap_err();
        assert!(matches!(err, InitError::MissingCredentials { .. }));
    }

    #[test]
    fn unknown_venue_is_a_typed_init_error() {
        let mut config = base_config(TradingMode::Live);
        config.exchange_id = "deribit".to_string();
        config.api_key = Some("k".to_string());
        config.secret_key = Some("s".to_string());
        let err = create_execution_gateway(&config).unwrap_err();
        assert!(matches!(err, InitError::UnknownVenue { .. }));
    }
}
