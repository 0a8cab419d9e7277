//! Core data model shared by every component of the decision-execution engine.
//!
//! Mirrors the Pydantic model used by the reference trading agent: instruments,
//! candles, feature vectors, portfolio state, plans/instructions, and the
//! execution results that flow back into portfolio accounting and history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a tradable instrument. Symbols are normalized per-exchange by
/// the execution gateway (`BTC-USDT` -> exchange-native form); this type
/// always carries the canonical `BASE-QUOTE` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub symbol: String,
    pub exchange_id: Option<String>,
}

impl InstrumentRef {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_id: None,
        }
    }

    pub fn with_exchange(symbol: impl Into<String>, exchange_id: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_id: Some(exchange_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    Live,
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketType {
    Spot,
    Swap,
    Future,
}

impl MarketType {
    pub fn is_spot(self) -> bool {
        matches!(self, MarketType::Spot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// A single OHLCV bar for one instrument/interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub instrument: InstrumentRef,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub interval: String,
}

/// A single meta value attached to a feature vector: either a label or a
/// number (interval tag, window bar count, timestamps).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    Number(f64),
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Number(v as f64)
    }
}

/// One symbol's computed indicator/snapshot values for a given grouping
/// bucket (an interval window, or the market snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub ts_ms: i64,
    pub instrument: InstrumentRef,
    pub values: HashMap<String, f64>,
    pub meta: HashMap<String, MetaValue>,
}

impl FeatureVector {
    pub fn group_by_key(&self) -> Option<&str> {
        match self.meta.get("group_by_key") {
            Some(MetaValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn interval(&self) -> Option<&str> {
        match self.meta.get("interval") {
            Some(MetaValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Long,
    Short,
}

/// Current state of one held (or just-closed) position for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument: InstrumentRef,
    /// Signed: positive is long, negative is short.
    pub quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub unrealized_pnl_pct: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub leverage: Option<Decimal>,
    pub entry_ts: Option<i64>,
    /// Set once the position returns to flat; kept as a tombstone so history
    /// and digest builders can still see the last-known state.
    pub closed_ts: Option<i64>,
    pub trade_type: Option<TradeType>,
}

impl PositionSnapshot {
    pub fn flat(instrument: InstrumentRef) -> Self {
        Self {
            instrument,
            quantity: Decimal::ZERO,
            avg_price: None,
            mark_price: None,
            unrealized_pnl: None,
            unrealized_pnl_pct: None,
            notional: None,
            leverage: None,
            entry_ts: None,
            closed_ts: None,
            trade_type: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Risk constraints attached to a strategy's portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub max_positions: Option<u32>,
    pub max_leverage: Option<Decimal>,
    pub quantity_step: Option<Decimal>,
    pub min_trade_qty: Option<Decimal>,
    pub max_order_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    pub max_position_qty: Option<Decimal>,
}

/// Full in-memory portfolio state, as reported to the composer and persisted
/// between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioView {
    pub strategy_id: Option<String>,
    pub ts_ms: i64,
    pub account_balance: Decimal,
    pub positions: HashMap<String, PositionSnapshot>,
    pub gross_exposure: Decimal,
    pub net_exposure: Decimal,
    pub total_value: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub total_realized_pnl: Decimal,
    pub buying_power: Decimal,
    pub free_cash: Decimal,
    pub constraints: Constraints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl TradeDecisionAction {
    /// `OPEN_LONG | CLOSE_SHORT -> BUY`, `OPEN_SHORT | CLOSE_LONG -> SELL`,
    /// `NOOP -> None`.
    pub fn derive_side(self) -> Option<OrderSide> {
        match self {
            TradeDecisionAction::OpenLong | TradeDecisionAction::CloseShort => {
                Some(OrderSide::Buy)
            }
            TradeDecisionAction::OpenShort | TradeDecisionAction::CloseLong => {
                Some(OrderSide::Sell)
            }
            TradeDecisionAction::Noop => None,
        }
    }

    pub fn is_close(self) -> bool {
        matches!(self, TradeDecisionAction::CloseLong | TradeDecisionAction::CloseShort)
    }
}

/// One item in a composer's raw proposal, before guardrail normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecisionItem {
    pub instrument: InstrumentRef,
    pub action: TradeDecisionAction,
    /// Magnitude of the requested operation size, not a signed final position.
    pub target_qty: Decimal,
    pub leverage: Option<Decimal>,
    pub confidence: Option<f64>,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlanProposal {
    pub ts: i64,
    pub items: Vec<TradeDecisionItem>,
    pub rationale: Option<String>,
}

impl TradePlanProposal {
    pub fn empty(ts: i64, rationale: impl Into<String>) -> Self {
        Self {
            ts,
            items: Vec::new(),
            rationale: Some(rationale.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceMode {
    Market,
    Limit,
}

/// A fully guardrail-normalized, executable instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeInstruction {
    /// Deterministic: `compose_id:symbol:(item_idx*10 + sub_step)`.
    pub instruction_id: String,
    pub compose_id: String,
    pub instrument: InstrumentRef,
    pub action: TradeDecisionAction,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub leverage: Option<Decimal>,
    pub price_mode: PriceMode,
    pub limit_price: Option<Decimal>,
    pub max_slippage_bps: Option<u32>,
    pub meta: HashMap<String, Value>,
}

impl TradeInstruction {
    pub fn reduce_only(&self) -> bool {
        matches!(self.meta.get("reduceOnly"), Some(Value::Bool(true)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Filled,
    Partial,
    Rejected,
    Error,
}

/// Result of submitting one instruction to an execution gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub instruction_id: String,
    pub instrument: InstrumentRef,
    pub side: OrderSide,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_exec_price: Option<Decimal>,
    pub slippage_bps: Option<f64>,
    pub fee_cost: Option<Decimal>,
    pub leverage: Option<Decimal>,
    pub status: TxStatus,
    pub reason: Option<String>,
}

impl TxResult {
    pub fn is_actionable_fill(&self) -> bool {
        matches!(self.status, TxStatus::Filled | TxStatus::Partial) && self.filled_qty > Decimal::ZERO
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, TxStatus::Rejected | TxStatus::Error)
    }
}

/// A settled/rolled trade record: either a still-open fill event or a closed
/// trade pairing an earlier open with its exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    pub trade_id: String,
    pub compose_id: Option<String>,
    pub instruction_id: Option<String>,
    pub instrument: InstrumentRef,
    #[serde(rename = "type")]
    pub trade_type: Option<TradeType>,
    pub side: Option<OrderSide>,
    pub leverage: Option<Decimal>,
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub avg_exec_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub realized_pnl_pct: Option<Decimal>,
    pub notional_entry: Option<Decimal>,
    pub notional_exit: Option<Decimal>,
    pub fee_cost: Option<Decimal>,
    pub entry_ts: Option<i64>,
    pub exit_ts: Option<i64>,
    pub trade_ts: Option<i64>,
    pub holding_ms: Option<i64>,
    pub note: Option<String>,
}

impl TradeHistoryEntry {
    pub fn is_closed(&self) -> bool {
        self.exit_ts.is_some() && self.exit_price.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRecordKind {
    Features,
    Compose,
    Instructions,
    Execution,
}

/// One ring-buffer entry in the recorder: a tagged, timestamped payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub ts: i64,
    pub kind: HistoryRecordKind,
    pub reference_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolDigestEntry {
    pub trade_count: u64,
    pub realized_pnl: Decimal,
    pub win_rate: Option<f64>,
    pub avg_holding_ms: Option<f64>,
    pub last_trade_ts: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeDigest {
    pub per_symbol: HashMap<String, SymbolDigestEntry>,
    pub sharpe_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    NormalExit,
    Cancelled,
    Error,
    ErrorClosingPositions,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::NormalExit => "NORMAL_EXIT",
            StopReason::Cancelled => "CANCELLED",
            StopReason::Error => "ERROR",
            StopReason::ErrorClosingPositions => "ERROR_CLOSING_POSITIONS",
        };
        write!(f, "{s}")
    }
}

/// Per-cycle per-strategy summary, persisted and also forwarded to the
/// composer as part of the digest context on the following cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySummary {
    pub strategy_id: String,
    pub ts_ms: i64,
    pub total_value: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub realized_pnl_pct: Option<Decimal>,
    pub active_positions: u32,
}

/// Context handed to a `Composer` for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeContext {
    pub ts: i64,
    pub compose_id: String,
    pub strategy_id: Option<String>,
    pub features: Vec<FeatureVector>,
    pub portfolio: PortfolioView,
    pub digest: TradeDigest,
}

/// Result of a `Composer::compose` call: fully normalized instructions plus a
/// human-readable rationale (possibly amended with execution warnings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeResult {
    pub instructions: Vec<TradeInstruction>,
    pub rationale: Option<String>,
    /// Instructions guardrails rejected before they ever reached the
    /// execution gateway (e.g. failing `min_notional`), carried as
    /// already-`Rejected` results so the coordinator can fold them into the
    /// cycle's execution warnings the same way it folds gateway rejections.
    pub rejected: Vec<TxResult>,
}

/// One price/open-interest/funding snapshot for a symbol, in exchange-native
/// shape (keys mirror ccxt's `fetch_tickers`/`fetch_open_interest` output).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: HashMap<String, f64>,
    pub open_interest: Option<HashMap<String, f64>>,
    pub funding_rate: Option<HashMap<String, f64>>,
    /// Raw venue-native ticker fields (ccxt's `info` sub-object), used as a
    /// fallback when a venue only partially populates the unified `price`
    /// fields (e.g. some venues expose `high_24h`/`low_24h`/`best_bid`/
    /// `best_ask`/`volume_24h`/`base_volume` here instead of the unified
    /// keys above).
    pub info: HashMap<String, f64>,
}

/// Final result of one end-to-end decision cycle, returned by the
/// `DecisionCoordinator` and consumed by the `StreamController` for
/// persistence write-through.
#[derive(Debug, Clone)]
pub struct DecisionCycleResult {
    pub compose_id: String,
    pub timestamp_ms: i64,
    pub cycle_index: u64,
    pub rationale: Option<String>,
    pub instructions: Vec<TradeInstruction>,
    pub trades: Vec<TradeHistoryEntry>,
    pub portfolio_view: PortfolioView,
    pub strategy_summary: StrategySummary,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
