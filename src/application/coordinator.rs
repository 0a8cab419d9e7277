//! Decision coordinator: the per-cycle orchestration at the heart of this
//! engine. Runs the full cycle (portfolio pull → LIVE balance
//! sync → features → digest → compose → execute → trade-history build →
//! portfolio apply → summary → history record → digest rebuild → return),
//! plus `close_all_positions` for strategy shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::application::feature_pipeline::DefaultFeaturesPipeline;
use crate::application::history::{InMemoryHistoryRecorder, RollingDigestBuilder};
use crate::application::portfolio_service::InMemoryPortfolioService;
use crate::domain::ports::{Composer, ExecutionGateway, MarketDataSource};
use crate::domain::request::UserRequest;
use crate::domain::types::{
    now_ms, ComposeContext, DecisionCycleResult, FeatureVector, HistoryRecordKind, MarketType,
    OrderSide, PositionSnapshot, StrategySummary, TradeHistoryEntry, TradeType, TradingMode,
    TxResult,
};

pub struct DefaultDecisionCoordinator {
    request: UserRequest,
    strategy_id: String,
    features_pipeline: DefaultFeaturesPipeline,
    gateway: Arc<dyn ExecutionGateway>,
    composer: Arc<dyn Composer>,
    portfolio: InMemoryPortfolioService,
    history: InMemoryHistoryRecorder,
    digest_builder: RollingDigestBuilder,
    cycle_index: u64,
    equities: Vec<Decimal>,
    trade_history: Vec<TradeHistoryEntry>,
}

impl DefaultDecisionCoordinator {
    pub fn new(
        request: UserRequest,
        strategy_id: String,
        market_data: Arc<dyn MarketDataSource>,
        gateway: Arc<dyn ExecutionGateway>,
        composer: Arc<dyn Composer>,
        portfolio: InMemoryPortfolioService,
    ) -> Self {
        Self {
            features_pipeline: DefaultFeaturesPipeline::new(market_data, gateway.clone()),
            request,
            strategy_id,
            gateway,
            composer,
            portfolio,
            history: InMemoryHistoryRecorder::new(),
            digest_builder: RollingDigestBuilder::new(),
            cycle_index: 0,
            equities: Vec::new(),
            trade_history: Vec::new(),
        }
    }

    pub fn portfolio_view(&self) -> crate::domain::types::PortfolioView {
        self.portfolio.get_view()
    }

    /// Runs one full decision cycle.
    pub async fn run_once(&mut self) -> Result<DecisionCycleResult> {
        let ts = now_ms();
        let compose_id = format!("compose-{}", Uuid::new_v4());

        if self.request.exchange_config.trading_mode == TradingMode::Live {
            self.sync_live_balance().await;
        }

        let symbols = self.request.trading_config.normalized_symbols();
        let features = self.features_pipeline.build(&symbols).await;

        let digest = self.digest_builder.build(&self.trade_history, &self.equities, self.request.trading_config.decide_interval_secs);

        let portfolio_before = self.portfolio.get_view();
        let pre_positions = portfolio_before.positions.clone();

        let context = ComposeContext {
            ts,
            compose_id: compose_id.clone(),
            strategy_id: Some(self.strategy_id.clone()),
            features: features.clone(),
            portfolio: portfolio_before,
            digest,
        };

        let compose_result = self.composer.compose(&context).await?;
        let mut rationale = compose_result.rationale;

        let market_snapshot = market_snapshot_map(&features);
        let tx_results = if compose_result.instructions.is_empty() {
            Vec::new()
        } else {
            self.gateway.execute(&compose_result.instructions, Some(&market_snapshot)).await?
        };

        let (ok_results, mut warnings) = partition_results(&tx_results);
        if !compose_result.rejected.is_empty() {
            let (_, guardrail_warnings) = partition_results(&compose_result.rejected);
            warnings.extend(guardrail_warnings);
        }
        if !warnings.is_empty() {
            let warning_block = format!(
                "\n\nExecution Warnings:\n{}",
                warnings.iter().map(|w| format!("- {w}")).collect::<Vec<_>>().join("\n")
            );
            rationale = Some(rationale.unwrap_or_default() + &warning_block);
        }

        let trades = build_trade_history(&ok_results, &pre_positions, ts, &compose_id);

        self.portfolio.apply_trades(&trades, &features);
        let portfolio_view = self.portfolio.get_view();

        let strategy_summary = build_summary(&self.strategy_id, ts, &portfolio_view);
        self.equities.push(portfolio_view.total_value);
        self.trade_history.extend(trades.iter().cloned());

        self.history.record(
            HistoryRecordKind::Features,
            compose_id.clone(),
            serde_json::to_value(&features).unwrap_or_default(),
        );
        self.history.record(
            HistoryRecordKind::Compose,
            compose_id.clone(),
            serde_json::json!({ "summary": { "total_value": portfolio_view.total_value.to_string() }, "rationale": rationale }),
        );
        self.history.record(
            HistoryRecordKind::Instructions,
            compose_id.clone(),
            serde_json::to_value(&compose_result.instructions).unwrap_or_default(),
        );
        self.history.record(
            HistoryRecordKind::Execution,
            compose_id.clone(),
            serde_json::to_value(&trades).unwrap_or_default(),
        );

        self.cycle_index += 1;

        Ok(DecisionCycleResult {
            compose_id,
            timestamp_ms: ts,
            cycle_index: self.cycle_index,
            rationale,
            instructions: compose_result.instructions,
            trades,
            portfolio_view,
            strategy_summary,
        })
    }

    async fn sync_live_balance(&mut self) {
        match self.gateway.fetch_balance().await {
            Ok(balances) => {
                let total_cash: Decimal = balances.values().map(|b| b.total).sum();
                let free_cash: Decimal = balances.values().map(|b| b.free).sum();
                if self.portfolio.market_type() == MarketType::Spot {
                    self.portfolio.set_cash(free_cash);
                } else {
                    self.portfolio.set_cash(total_cash);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, strategy_id = %self.strategy_id, "LIVE balance sync failed, keeping prior cash");
            }
        }

        match self.gateway.fetch_positions(None).await {
            Ok(positions) => {
                let map = positions.into_iter().map(|p| (p.instrument.symbol.clone(), p)).collect();
                self.portfolio.replace_positions(map);
            }
            Err(err) => {
                tracing::warn!(error = %err, strategy_id = %self.strategy_id, "LIVE position sync failed, keeping prior positions");
            }
        }
    }

    /// Generates `reduceOnly=true` close instructions for every open
    /// position, executes them, folds the resulting trades into the
    /// portfolio, and records them to history.
    pub async fn close_all_positions(&mut self) -> Result<Vec<TradeHistoryEntry>> {
        use crate::domain::types::{PriceMode, TradeDecisionAction, TradeInstruction};

        let open_positions: Vec<PositionSnapshot> = self
            .portfolio
            .get_view()
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect();
        if open_positions.is_empty() {
            return Ok(Vec::new());
        }

        let ts = now_ms();
        let compose_id = format!("close-all-{}", Uuid::new_v4());
        let instructions: Vec<TradeInstruction> = open_positions
            .iter()
            .enumerate()
            .map(|(idx, pos)| {
                let (action, side) = if pos.quantity > Decimal::ZERO {
                    (TradeDecisionAction::CloseLong, OrderSide::Sell)
                } else {
                    (TradeDecisionAction::CloseShort, OrderSide::Buy)
                };
                let mut meta = HashMap::new();
                meta.insert("reduceOnly".to_string(), serde_json::json!(true));
                TradeInstruction {
                    instruction_id: format!("{compose_id}:{}:{}", pos.instrument.symbol, idx * 10),
                    compose_id: compose_id.clone(),
                    instrument: pos.instrument.clone(),
                    action,
                    side,
                    quantity: pos.quantity.abs(),
                    leverage: pos.leverage,
                    price_mode: PriceMode::Market,
                    limit_price: None,
                    max_slippage_bps: None,
                    meta,
                }
            })
            .collect();

        let pre_positions = self.portfolio.get_view().positions.clone();
        let tx_results = self.gateway.execute(&instructions, None).await?;
        let (ok_results, _warnings) = partition_results(&tx_results);
        let trades = build_trade_history(&ok_results, &pre_positions, ts, &compose_id);
        self.portfolio.apply_trades(&trades, &[]);
        self.trade_history.extend(trades.iter().cloned());

        self.history.record(
            HistoryRecordKind::Execution,
            compose_id,
            serde_json::to_value(&trades).unwrap_or_default(),
        );
        Ok(trades)
    }

    pub async fn close(&self) -> Result<()> {
        self.gateway.close().await
    }
}

fn market_snapshot_map(features: &[FeatureVector]) -> HashMap<String, crate::domain::types::MarketSnapshot> {
    let mut map: HashMap<String, crate::domain::types::MarketSnapshot> = HashMap::new();
    for fv in features {
        if fv.group_by_key() != Some("market_snapshot") {
            continue;
        }
        let snapshot = map.entry(fv.instrument.symbol.clone()).or_default();
        for (key, value) in &fv.values {
            if let Some(field) = key.strip_prefix("price.") {
                snapshot.price.insert(field.to_string(), *value);
            }
        }
    }
    map
}

/// Splits tx results into actionable fills and human-readable warning
/// strings for rejected/errored instructions.
fn partition_results(results: &[TxResult]) -> (Vec<TxResult>, Vec<String>) {
    let mut ok = Vec::new();
    let mut warnings = Vec::new();
    for r in results {
        if r.is_failure() {
            warnings.push(format!(
                "{} {} rejected: {}",
                r.instrument.symbol,
                r.side,
                r.reason.clone().unwrap_or_else(|| "unknown reason".to_string())
            ));
        } else if r.is_actionable_fill() {
            ok.push(r.clone());
        }
    }
    (ok, warnings)
}

/// Classifies each fill against the pre-apply position to build history
/// entries: open (current==0), full close (new==0), increase (same sign,
/// growing), or partial close (same sign, shrinking). Direction flips never
/// reach here as a single fill because guardrails splits a flip into two
/// sub-step instructions (never-flip-directly).
fn build_trade_history(
    results: &[TxResult],
    pre_positions: &HashMap<String, PositionSnapshot>,
    ts: i64,
    compose_id: &str,
) -> Vec<TradeHistoryEntry> {
    let mut out = Vec::with_capacity(results.len());
    for r in results {
        let symbol = &r.instrument.symbol;
        let prior = pre_positions.get(symbol);
        let current_qty = prior.map(|p| p.quantity).unwrap_or(Decimal::ZERO);
        let sign = match r.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };
        let signed_delta = sign * r.filled_qty;
        let new_qty = current_qty + signed_delta;
        let exec_price = r.avg_exec_price;

        let entry = if current_qty.is_zero() {
            TradeHistoryEntry {
                trade_id: format!("trade-{}", Uuid::new_v4()),
                compose_id: Some(compose_id.to_string()),
                instruction_id: Some(r.instruction_id.clone()),
                instrument: r.instrument.clone(),
                trade_type: Some(if new_qty > Decimal::ZERO { TradeType::Long } else { TradeType::Short }),
                side: Some(r.side),
                leverage: r.leverage,
                quantity: r.filled_qty,
                entry_price: exec_price,
                exit_price: None,
                avg_exec_price: exec_price,
                unrealized_pnl: None,
                realized_pnl: None,
                realized_pnl_pct: None,
                notional_entry: exec_price.map(|p| p * r.filled_qty),
                notional_exit: None,
                fee_cost: r.fee_cost,
                entry_ts: Some(ts),
                exit_ts: None,
                trade_ts: Some(ts),
                holding_ms: None,
                note: None,
            }
        } else if new_qty.is_zero() {
            let entry_ts = prior.and_then(|p| p.entry_ts).unwrap_or(ts);
            let entry_price = prior.and_then(|p| p.avg_price);
            let realized = match (entry_price, exec_price) {
                (Some(entry), Some(exit)) => {
                    let dir = prior.and_then(|p| p.trade_type).unwrap_or(TradeType::Long);
                    let pnl = match dir {
                        TradeType::Long => (exit - entry) * r.filled_qty,
                        TradeType::Short => (entry - exit) * r.filled_qty,
                    };
                    Some(pnl - r.fee_cost.unwrap_or(Decimal::ZERO))
                }
                _ => None,
            };
            TradeHistoryEntry {
                trade_id: format!("trade-{}", Uuid::new_v4()),
                compose_id: Some(compose_id.to_string()),
                instruction_id: Some(r.instruction_id.clone()),
                instrument: r.instrument.clone(),
                trade_type: prior.and_then(|p| p.trade_type),
                side: Some(r.side),
                leverage: r.leverage,
                quantity: r.filled_qty,
                entry_price,
                exit_price: exec_price,
                avg_exec_price: exec_price,
                unrealized_pnl: None,
                realized_pnl: realized,
                realized_pnl_pct: match (realized, entry_price) {
                    (Some(pnl), Some(entry)) if !entry.is_zero() => {
                        Some(pnl / (entry * r.filled_qty) * Decimal::new(100, 0))
                    }
                    _ => None,
                },
                notional_entry: entry_price.map(|p| p * r.filled_qty),
                notional_exit: exec_price.map(|p| p * r.filled_qty),
                fee_cost: r.fee_cost,
                entry_ts: Some(entry_ts),
                exit_ts: Some(ts),
                trade_ts: Some(ts),
                holding_ms: Some(ts - entry_ts),
                note: None,
            }
        } else if current_qty.signum() == new_qty.signum() && new_qty.abs() > current_qty.abs() {
            let entry_ts = prior.and_then(|p| p.entry_ts).unwrap_or(ts);
            TradeHistoryEntry {
                trade_id: format!("trade-{}", Uuid::new_v4()),
                compose_id: Some(compose_id.to_string()),
                instruction_id: Some(r.instruction_id.clone()),
                instrument: r.instrument.clone(),
                trade_type: Some(if new_qty > Decimal::ZERO { TradeType::Long } else { TradeType::Short }),
                side: Some(r.side),
                leverage: r.leverage,
                quantity: r.filled_qty,
                entry_price: exec_price,
                exit_price: None,
                avg_exec_price: exec_price,
                unrealized_pnl: None,
                realized_pnl: None,
                realized_pnl_pct: None,
                notional_entry: exec_price.map(|p| p * r.filled_qty),
                notional_exit: None,
                fee_cost: r.fee_cost,
                entry_ts: Some(entry_ts),
                exit_ts: None,
                trade_ts: Some(ts),
                holding_ms: None,
                note: Some("increase".to_string()),
            }
        } else {
            // Partial close: same direction, shrinking but not flat. The
            // in-memory ring buffer doesn't support mutating an earlier
            // open record in place, so the partial exit is recorded as its
            // own entry carrying the prior entry fields (deliberate
            // simplification of the reference "annotate prior open" shape).
            let entry_ts = prior.and_then(|p| p.entry_ts).unwrap_or(ts);
            let entry_price = prior.and_then(|p| p.avg_price);
            let realized = match (entry_price, exec_price) {
                (Some(entry), Some(exit)) => {
                    let dir = prior.and_then(|p| p.trade_type).unwrap_or(TradeType::Long);
                    let pnl = match dir {
                        TradeType::Long => (exit - entry) * r.filled_qty,
                        TradeType::Short => (entry - exit) * r.filled_qty,
                    };
                    Some(pnl - r.fee_cost.unwrap_or(Decimal::ZERO))
                }
                _ => None,
            };
            TradeHistoryEntry {
                trade_id: format!("trade-{}", Uuid::new_v4()),
                compose_id: Some(compose_id.to_string()),
                instruction_id: Some(r.instruction_id.clone()),
                instrument: r.instrument.clone(),
                trade_type: prior.and_then(|p| p.trade_type),
                side: Some(r.side),
                leverage: r.leverage,
                quantity: r.filled_qty,
                entry_price,
                exit_price: exec_price,
                avg_exec_price: exec_price,
                unrealized_pnl: None,
                realized_pnl: realized,
                realized_pnl_pct: None,
                notional_entry: entry_price.map(|p| p * r.filled_qty),
                notional_exit: exec_price.map(|p| p * r.filled_qty),
                fee_cost: r.fee_cost,
                entry_ts: Some(entry_ts),
                exit_ts: Some(ts),
                trade_ts: Some(ts),
                holding_ms: Some(ts - entry_ts),
                note: Some("partial_close".to_string()),
            }
        };
        out.push(entry);
    }
    out
}

fn build_summary(strategy_id: &str, ts: i64, view: &crate::domain::types::PortfolioView) -> StrategySummary {
    let realized_pnl_pct = if !view.account_balance.is_zero() {
        Some(view.total_realized_pnl / view.account_balance * Decimal::new(100, 0))
    } else {
        None
    };
    StrategySummary {
        strategy_id: strategy_id.to_string(),
        ts_ms: ts,
        total_value: view.total_value,
        total_realized_pnl: view.total_realized_pnl,
        total_unrealized_pnl: view.total_unrealized_pnl,
        realized_pnl_pct,
        active_positions: view.positions.values().filter(|p| !p.is_flat()).count() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::InstrumentRef;
    use rust_decimal_macros::dec;

    #[test]
    fn build_trade_history_detects_open() {
        let result = TxResult {
            instruction_id: "c1:BTC-USDT:0".to_string(),
            instrument: InstrumentRef::new("BTC-USDT"),
            side: OrderSide::Buy,
            requested_qty: dec!(1),
            filled_qty: dec!(1),
            avg_exec_price: Some(dec!(100)),
            slippage_bps: None,
            fee_cost: None,
            leverage: Some(dec!(1)),
            status: crate::domain::types::TxStatus::Filled,
            reason: None,
        };
        let trades = build_trade_history(&[result], &HashMap::new(), 1000, "c1");
        assert_eq!(trades.len(), 1);
        assert!(!trades[0].is_closed());
        assert_eq!(trades[0].trade_type, Some(TradeType::Long));
    }

    #[test]
    fn build_trade_history_detects_full_close() {
        let mut pre = HashMap::new();
        let mut pos = PositionSnapshot::flat(InstrumentRef::new("BTC-USDT"));
        pos.quantity = dec!(1);
        pos.avg_price = Some(dec!(100));
        pos.entry_ts = Some(500);
        pos.trade_type = Some(TradeType::Long);
        pre.insert("BTC-USDT".to_string(), pos);

        let result = TxResult {
            instruction_id: "c1:BTC-USDT:0".to_string(),
            instrument: InstrumentRef::new("BTC-USDT"),
            side: OrderSide::Sell,
            requested_qty: dec!(1),
            filled_qty: dec!(1),
            avg_exec_price: Some(dec!(110)),
            slippage_bps: None,
            fee_cost: None,
            leverage: Some(dec!(1)),
            status: crate::domain::types::TxStatus::Filled,
            reason: None,
        };
        let trades = build_trade_history(&[result], &pre, 1500, "c1");
        assert_eq!(trades.len(), 1);
        assert!(trades[0].is_closed());
        assert_eq!(trades[0].realized_pnl, Some(dec!(10)));
        assert_eq!(trades[0].holding_ms, Some(1000));
    }
}
