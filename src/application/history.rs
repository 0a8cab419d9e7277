//! Bounded in-memory history recorder and rolling trade digest builder.
//! The recorder keeps the last `capacity` records of
//! each cycle phase (features/compose/instructions/execution) for
//! diagnostics; the digest builder summarizes the last `WINDOW` closed
//! trades per symbol plus a Sharpe ratio over the strategy's equity curve.

use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;

use crate::domain::types::{
    now_ms, HistoryRecord, HistoryRecordKind, SymbolDigestEntry, TradeDigest, TradeHistoryEntry,
};

const DEFAULT_CAPACITY: usize = 200;
const DIGEST_WINDOW: usize = 50;

pub struct InMemoryHistoryRecorder {
    capacity: usize,
    records: VecDeque<HistoryRecord>,
}

impl InMemoryHistoryRecorder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, kind: HistoryRecordKind, reference_id: impl Into<String>, payload: serde_json::Value) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(HistoryRecord {
            ts: now_ms(),
            kind,
            reference_id: reference_id.into(),
            payload,
        });
    }

    pub fn recent(&self, kind: HistoryRecordKind, limit: usize) -> Vec<&HistoryRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.kind == kind)
            .take(limit)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryHistoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RollingDigestBuilder {
    window: usize,
}

impl RollingDigestBuilder {
    pub fn new() -> Self {
        Self { window: DIGEST_WINDOW }
    }

    /// Builds a per-symbol digest from the most recent closed trades, plus a
    /// Sharpe ratio computed from the strategy's equity curve (one sample per
    /// cycle, spaced `decide_interval_secs` apart).
    pub fn build(&self, trades: &[TradeHistoryEntry], equities: &[Decimal], decide_interval_secs: u64) -> TradeDigest {
        let closed: Vec<&TradeHistoryEntry> = trades.iter().filter(|t| t.is_closed()).rev().take(self.window).collect();

        let mut per_symbol: HashMap<String, SymbolDigestEntry> = HashMap::new();
        for trade in &closed {
            let entry = per_symbol.entry(trade.instrument.symbol.clone()).or_default();
            entry.trade_count += 1;
            if let Some(pnl) = trade.realized_pnl {
                entry.realized_pnl += pnl;
            }
            if let Some(ts) = trade.trade_ts.or(trade.exit_ts) {
                entry.last_trade_ts = Some(entry.last_trade_ts.map_or(ts, |prev| prev.max(ts)));
            }
        }
        for (symbol, entry) in per_symbol.iter_mut() {
            let symbol_trades: Vec<&&TradeHistoryEntry> = closed.iter().filter(|t| t.instrument.symbol == *symbol).collect();
            let wins = symbol_trades
                .iter()
                .filter(|t| t.realized_pnl.map(|p| p > Decimal::ZERO).unwrap_or(false))
                .count();
            entry.win_rate = if symbol_trades.is_empty() {
                None
            } else {
                Some(wins as f64 / symbol_trades.len() as f64)
            };
            let holdings: Vec<f64> = symbol_trades.iter().filter_map(|t| t.holding_ms).map(|ms| ms as f64).collect();
            entry.avg_holding_ms = if holdings.is_empty() {
                None
            } else {
                Some(holdings.iter().sum::<f64>() / holdings.len() as f64)
            };
        }

        TradeDigest {
            per_symbol,
            sharpe_ratio: sharpe_ratio(equities, decide_interval_secs),
        }
    }
}

impl Default for RollingDigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `periods_per_year = (365*24*3600)/Δt`; `period_rf = 0.03/periods_per_year`;
/// `Sharpe = (mean(r)-period_rf)/stddev(r, ddof=1)`. Null when fewer than two
/// equity samples or the return series has zero variance.
fn sharpe_ratio(equities: &[Decimal], decide_interval_secs: u64) -> Option<f64> {
    if equities.len() < 2 || decide_interval_secs == 0 {
        return None;
    }
    let returns: Vec<f64> = equities
        .windows(2)
        .filter_map(|pair| {
            let (prev, cur) = (pair[0], pair[1]);
            if prev.is_zero() {
                None
            } else {
                ((cur - prev) / prev).to_string().parse::<f64>().ok()
            }
        })
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let seconds_per_year = 365.0 * 24.0 * 3600.0;
    let periods_per_year = seconds_per_year / decide_interval_secs as f64;
    let period_rf = 0.03 / periods_per_year;

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() as f64 - 1.0);
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return None;
    }
    Some((mean - period_rf) / stddev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::InstrumentRef;
    use rust_decimal_macros::dec;

    fn closed_trade(symbol: &str, pnl: Decimal, holding_ms: i64, exit_ts: i64) -> TradeHistoryEntry {
        TradeHistoryEntry {
            trade_id: format!("t-{symbol}-{exit_ts}"),
            compose_id: None,
            instruction_id: None,
            instrument: InstrumentRef::new(symbol),
            trade_type: None,
            side: None,
            leverage: None,
            quantity: dec!(1),
            entry_price: Some(dec!(100)),
            exit_price: Some(dec!(110)),
            avg_exec_price: None,
            unrealized_pnl: None,
            realized_pnl: Some(pnl),
            realized_pnl_pct: None,
            notional_entry: None,
            notional_exit: None,
            fee_cost: None,
            entry_ts: Some(exit_ts - holding_ms),
            exit_ts: Some(exit_ts),
            trade_ts: Some(exit_ts),
            holding_ms: Some(holding_ms),
            note: None,
        }
    }

    #[test]
    fn digest_computes_win_rate_and_avg_holding() {
        let trades = vec![
            closed_trade("BTC-USDT", dec!(10), 1000, 1),
            closed_trade("BTC-USDT", dec!(-5), 3000, 2),
        ];
        let digest = RollingDigestBuilder::new().build(&trades, &[], 60);
        let btc = digest.per_symbol.get("BTC-USDT").unwrap();
        assert_eq!(btc.trade_count, 2);
        assert_eq!(btc.win_rate, Some(0.5));
        assert_eq!(btc.avg_holding_ms, Some(2000.0));
    }

    #[test]
    fn sharpe_is_none_with_fewer_than_two_equities() {
        assert_eq!(sharpe_ratio(&[dec!(1000)], 60), None);
    }

    #[test]
    fn sharpe_is_none_when_returns_constant() {
        let equities = vec![dec!(1000), dec!(1000), dec!(1000)];
        assert_eq!(sharpe_ratio(&equities, 60), None);
    }

    #[test]
    fn sharpe_is_some_with_varying_returns() {
        let equities = vec![dec!(1000), dec!(1010), dec!(990), dec!(1020)];
        let sharpe = sharpe_ratio(&equities, 60);
        assert!(sharpe.is_some());
    }

    #[test]
    fn history_recorder_evicts_oldest_past_capacity() {
        let mut recorder = InMemoryHistoryRecorder::with_capacity(2);
        recorder.record(HistoryRecordKind::Compose, "a", serde_json::json!({}));
        recorder.record(HistoryRecordKind::Compose, "b", serde_json::json!({}));
        recorder.record(HistoryRecordKind::Compose, "c", serde_json::json!({}));
        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.recent(HistoryRecordKind::Compose, 10)[1].reference_id, "b");
    }
}
