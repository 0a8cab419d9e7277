//! End-to-end exercise of one decision cycle: grid composer -> guardrail
//! normalization -> paper fills -> portfolio accounting, wired the same way
//! `create_strategy_runtime` wires a live strategy, minus persistence.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal_macros::dec;

use strategy_engine::application::composer::guardrails::{self, GuardrailParams};
use strategy_engine::application::composer::GridComposer;
use strategy_engine::application::coordinator::DefaultDecisionCoordinator;
use strategy_engine::application::execution::PaperExecutionGateway;
use strategy_engine::application::portfolio_service::InMemoryPortfolioService;
use strategy_engine::domain::ports::{Composer, MarketDataSource};
use strategy_engine::domain::request::{ExchangeConfig, TradingConfig, UserRequest};
use strategy_engine::domain::types::{
    Candle, ComposeContext, ComposeResult, Constraints, InstrumentRef, MarginMode, MarketSnapshot,
    MarketType, TradeDecisionAction, TradeDecisionItem, TradePlanProposal, TradingMode,
};

/// Always answers with the same flat-then-down candle window, so the grid
/// composer's `change_pct` mean-reversion trigger fires deterministically.
struct FixedMarketData {
    candles: Vec<Candle>,
    last_price: f64,
}

#[async_trait]
impl MarketDataSource for FixedMarketData {
    async fn get_recent_candles(
        &self,
        _symbols: &[String],
        _interval: &str,
        _lookback: usize,
    ) -> Result<Vec<Candle>> {
        Ok(self.candles.clone())
    }

    async fn get_market_snapshot(&self, symbols: &[String]) -> Result<HashMap<String, MarketSnapshot>> {
        let mut out = HashMap::new();
        for symbol in symbols {
            let mut snapshot = MarketSnapshot::default();
            snapshot.price.insert("last".to_string(), self.last_price);
            out.insert(symbol.clone(), snapshot);
        }
        Ok(out)
    }
}

fn declining_candles(symbol: &str) -> Vec<Candle> {
    let mut candles = Vec::new();
    for i in 0..240 {
        let close = if i == 239 { 99.0 } else { 100.0 };
        candles.push(Candle {
            ts_ms: i as i64 * 60_000,
            instrument: InstrumentRef::new(symbol),
            open: dec!(100),
            high: dec!(100),
            low: dec!(99),
            close: rust_decimal::Decimal::try_from(close).unwrap(),
            volume: dec!(10),
            interval: "1m".to_string(),
        });
    }
    candles
}

fn virtual_request(symbol: &str) -> UserRequest {
    UserRequest {
        exchange_config: ExchangeConfig {
            exchange_id: "binance".to_string(),
            trading_mode: TradingMode::Virtual,
            market_type: MarketType::Swap,
            margin_mode: MarginMode::Cross,
            api_key: None,
            secret_key: None,
            passphrase: None,
            testnet: true,
        },
        trading_config: TradingConfig {
            strategy_name: "grid-test".to_string(),
            symbols: vec![symbol.to_string()],
            initial_capital: 10_000.0,
            max_leverage: Some(3.0),
            max_positions: Some(5),
            decide_interval_secs: 60,
            custom_prompt: None,
            prompt_text: None,
        },
        llm_model_config: None,
    }
}

#[tokio::test]
async fn grid_strategy_opens_a_position_on_a_dip_and_updates_portfolio() {
    let symbol = "BTC-USDT";
    let request = virtual_request(symbol);

    let market_data = Arc::new(FixedMarketData {
        candles: declining_candles(symbol),
        last_price: 99.0,
    });
    let gateway = Arc::new(PaperExecutionGateway::new(dec!(10)));
    let composer = Arc::new(GridComposer::new(request.clone()));
    let portfolio = InMemoryPortfolioService::new(
        "strategy-under-test".to_string(),
        dec!(10000),
        TradingMode::Virtual,
        MarketType::Swap,
        Constraints {
            max_leverage: Some(dec!(3)),
            max_positions: Some(5),
            ..Default::default()
        },
    );

    let mut coordinator = DefaultDecisionCoordinator::new(
        request,
        "strategy-under-test".to_string(),
        market_data,
        gateway,
        composer,
        portfolio,
    );

    let result = coordinator.run_once().await.expect("cycle should succeed");

    assert!(!result.instructions.is_empty(), "grid composer should have proposed an open-long instruction");
    assert!(!result.trades.is_empty(), "paper gateway should have filled the instruction");

    let position = result
        .portfolio_view
        .positions
        .get(symbol)
        .expect("position should exist after a fill");
    assert!(position.quantity > rust_decimal::Decimal::ZERO, "fill should have opened a long");

    assert!(result.portfolio_view.total_value > rust_decimal::Decimal::ZERO);
    assert_eq!(result.strategy_summary.strategy_id, "strategy-under-test");
}

#[tokio::test]
async fn second_cycle_with_no_signal_is_a_noop() {
    let symbol = "ETH-USDT";
    let request = virtual_request(symbol);

    // Flat candles: change_pct stays at zero, no grid trigger fires.
    let flat_candles: Vec<Candle> = (0..240)
        .map(|i| Candle {
            ts_ms: i as i64 * 60_000,
            instrument: InstrumentRef::new(symbol),
            open: dec!(100),
            high: dec!(100),
            low: dec!(100),
            close: dec!(100),
            volume: dec!(10),
            interval: "1m".to_string(),
        })
        .collect();

    let market_data = Arc::new(FixedMarketData {
        candles: flat_candles,
        last_price: 100.0,
    });
    let gateway = Arc::new(PaperExecutionGateway::new(dec!(10)));
    let composer = Arc::new(GridComposer::new(request.clone()));
    let portfolio = InMemoryPortfolioService::new(
        "strategy-flat".to_string(),
        dec!(10000),
        TradingMode::Virtual,
        MarketType::Swap,
        Constraints {
            max_leverage: Some(dec!(3)),
            max_positions: Some(5),
            ..Default::default()
        },
    );

    let mut coordinator = DefaultDecisionCoordinator::new(
        request,
        "strategy-flat".to_string(),
        market_data,
        gateway,
        composer,
        portfolio,
    );

    let result = coordinator.run_once().await.expect("cycle should succeed");
    assert!(result.instructions.is_empty());
    assert!(result.trades.is_empty());
    assert_eq!(result.rationale.as_deref(), Some("Grid NOOP"));
}

/// A composer that always proposes opening a fixed quantity, unconditionally,
/// so a test can drive guardrails with a known target_qty.
struct FixedSizeComposer {
    symbol: String,
    target_qty: rust_decimal::Decimal,
    request: UserRequest,
}

#[async_trait]
impl Composer for FixedSizeComposer {
    async fn compose(&self, context: &ComposeContext) -> Result<ComposeResult> {
        let plan = TradePlanProposal {
            ts: context.ts,
            items: vec![TradeDecisionItem {
                instrument: InstrumentRef::new(self.symbol.clone()),
                action: TradeDecisionAction::OpenLong,
                target_qty: self.target_qty,
                leverage: Some(dec!(1)),
                confidence: None,
                rationale: None,
            }],
            rationale: Some("fixed-size test plan".to_string()),
        };
        let (instructions, rejected) = guardrails::normalize_plan(&self.request, &GuardrailParams::default(), context, &plan);
        Ok(ComposeResult {
            instructions,
            rationale: plan.rationale,
            rejected,
        })
    }
}

#[tokio::test]
async fn order_below_min_notional_is_rejected_and_appears_as_an_execution_warning() {
    let symbol = "XYZ-USDT";
    let mut request = virtual_request(symbol);
    request.exchange_config.market_type = MarketType::Spot;

    let market_data = Arc::new(FixedMarketData {
        candles: Vec::new(),
        last_price: 1.0,
    });
    let gateway = Arc::new(PaperExecutionGateway::new(dec!(10)));
    let composer = Arc::new(FixedSizeComposer {
        symbol: symbol.to_string(),
        target_qty: dec!(5),
        request: request.clone(),
    });
    let portfolio = InMemoryPortfolioService::new(
        "strategy-min-notional".to_string(),
        dec!(10000),
        TradingMode::Virtual,
        MarketType::Spot,
        Constraints {
            max_leverage: Some(dec!(1)),
            max_positions: Some(5),
            min_notional: Some(dec!(10)),
            ..Default::default()
        },
    );

    let mut coordinator = DefaultDecisionCoordinator::new(
        request,
        "strategy-min-notional".to_string(),
        market_data,
        gateway,
        composer,
        portfolio,
    );

    let result = coordinator.run_once().await.expect("cycle should succeed");

    assert!(result.instructions.is_empty(), "min_notional violation must never reach the gateway");
    assert!(result.trades.is_empty());

    let rationale = result.rationale.expect("rationale should carry the execution warning");
    assert!(rationale.contains("Execution Warnings:"));
    assert!(
        rationale.contains("XYZ-USDT BUY rejected: 5.0000 < min_notional=10"),
        "rationale was: {rationale}"
    );
}
