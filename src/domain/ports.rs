//! Capability interfaces, modeled as trait objects the coordinator depends
//! on. Each trait is a seam; concrete implementations
//! live under `application`/`infrastructure`.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::types::{
    Candle, ComposeContext, ComposeResult, MarketSnapshot, PositionSnapshot, TradeInstruction,
    TradePlanProposal, TxResult,
};

/// Fetches candles and market snapshots. Implementations must be best-effort
/// per-symbol: one symbol's failure must not abort the batch.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn get_recent_candles(
        &self,
        symbols: &[String],
        interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>>;

    async fn get_market_snapshot(&self, symbols: &[String]) -> Result<HashMap<String, MarketSnapshot>>;
}

/// A balance entry as reported by `fetch_balance`.
#[derive(Debug, Clone, Default)]
pub struct BalanceEntry {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

/// Submits normalized instructions to a real or simulated venue. Both the
/// `Paper` and venue-backed gateways implement this; see
/// `application::execution`.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_snapshot: Option<&HashMap<String, MarketSnapshot>>,
    ) -> Result<Vec<TxResult>>;

    async fn fetch_balance(&self) -> Result<HashMap<String, BalanceEntry>>;

    async fn fetch_positions(&self, symbols: Option<&[String]>) -> Result<Vec<PositionSnapshot>>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<String>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Option<f64>>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>>;

    /// Release any held resources (HTTP clients, websocket streams).
    async fn close(&self) -> Result<()>;
}

/// Opaque LLM integration point: provider wiring lives outside this crate,
/// treated as a single-method collaborator. Tests substitute a fixed-response stub.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<TradePlanProposal>;
}

/// Produces a trade plan from a compose context and applies guardrail
/// normalization, returning fully executable instructions.
#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&self, context: &ComposeContext) -> Result<ComposeResult>;
}

/// Sends a best-effort notification of a non-NOOP plan or a filled trade to
/// an external channel (Discord-style webhook). Never allowed to fail a
/// cycle; callers log and ignore errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Records cycle-level gauges/counters to an external metrics backend.
/// Never allowed to fail a cycle; implementations swallow their own errors.
pub trait MetricsSink: Send + Sync {
    fn record_cycle(&self, strategy_id: &str, instructions: &[TradeInstruction], portfolio_value: f64, cash: f64, positions_count: usize);
}

/// Clock abstraction so tests can control "now" deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
