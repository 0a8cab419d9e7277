//! Strategy runtime construction, including LIVE-mode initial-capital
//! bootstrap. Wires together the execution
//! gateway, market data source, composer, and portfolio service for one
//! strategy, fetching free cash from the venue first when trading LIVE.

use std::sync::Arc;

use anyhow::Result;

use crate::application::coordinator::DefaultDecisionCoordinator;
use crate::application::portfolio_service::InMemoryPortfolioService;
use crate::domain::errors::InitError;
use crate::domain::ports::{Composer, ExecutionGateway, MarketDataSource};
use crate::domain::request::UserRequest;
use crate::domain::types::{Constraints, TradingMode};

pub struct StrategyRuntime {
    pub strategy_id: String,
    pub coordinator: DefaultDecisionCoordinator,
    pub gateway: Arc<dyn ExecutionGateway>,
}

/// Builds a fresh runtime. For LIVE mode, fetches free cash from the gateway
/// and uses it as `initial_capital`, raising `InitError::NoInitialCapital`
/// if the venue reports nothing usable — distinct from the steady-state
/// LIVE balance sync that the coordinator performs every cycle thereafter.
pub async fn create_strategy_runtime(
    strategy_id: String,
    request: UserRequest,
    market_data: Arc<dyn MarketDataSource>,
    gateway: Arc<dyn ExecutionGateway>,
    composer: Arc<dyn Composer>,
) -> Result<StrategyRuntime, InitError> {
    let initial_capital = match request.exchange_config.trading_mode {
        TradingMode::Virtual => {
            rust_decimal::Decimal::try_from(request.trading_config.initial_capital).unwrap_or(rust_decimal::Decimal::ZERO)
        }
        TradingMode::Live => {
            let balances = gateway.fetch_balance().await.map_err(|_| InitError::NoInitialCapital {
                initial_capital: request.trading_config.initial_capital,
            })?;
            let free_cash: rust_decimal::Decimal = balances.values().map(|b| b.free).sum();
            if free_cash.is_zero() {
                return Err(InitError::NoInitialCapital {
                    initial_capital: request.trading_config.initial_capital,
                });
            }
            free_cash
        }
    };

    let constraints = Constraints {
        max_positions: request.trading_config.max_positions,
        max_leverage: Some(request.max_leverage_decimal()),
        ..Default::default()
    };

    let portfolio = InMemoryPortfolioService::new(
        strategy_id.clone(),
        initial_capital,
        request.exchange_config.trading_mode,
        request.exchange_config.market_type,
        constraints,
    );

    let coordinator = DefaultDecisionCoordinator::new(
        request,
        strategy_id.clone(),
        market_data,
        gateway.clone(),
        composer,
        portfolio,
    );

    Ok(StrategyRuntime {
        strategy_id,
        coordinator,
        gateway,
    })
}
