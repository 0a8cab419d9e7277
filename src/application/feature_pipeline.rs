//! Turns raw candles and market snapshots into per-symbol `FeatureVector`s.
//! Two candle windows (micro "1s"x180, medium "1m"x240)
//! plus one market-snapshot computation are concatenated by
//! `DefaultFeaturesPipeline::build`.

use std::collections::HashMap;

use async_trait::async_trait;
use ta::indicators::{BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence};
use ta::Next;

use crate::domain::ports::{ExecutionGateway, MarketDataSource};
use crate::domain::types::{Candle, FeatureVector, InstrumentRef, MarketSnapshot, MetaValue};

pub const MICRO_INTERVAL: &str = "1s";
pub const MICRO_WINDOW: usize = 180;
pub const MEDIUM_INTERVAL: &str = "1m";
pub const MEDIUM_WINDOW: usize = 240;

/// Computes one `FeatureVector` per symbol for a single candle window,
/// taking the last bar's indicator values.
pub struct CandleFeatureComputer;

impl CandleFeatureComputer {
    /// `candles` must already be sorted ascending by `ts_ms` and belong to a
    /// single symbol/interval.
    pub fn compute(instrument: &InstrumentRef, candles: &[Candle], interval: &str) -> Option<FeatureVector> {
        if candles.is_empty() {
            return None;
        }

        let closes: Vec<f64> = candles
            .iter()
            .map(|c| c.close.to_string().parse::<f64>().unwrap_or(0.0))
            .collect();

        let mut values = HashMap::new();

        let mut ema12 = ExponentialMovingAverage::new(12).ok();
        let mut ema26 = ExponentialMovingAverage::new(26).ok();
        let mut ema50 = ExponentialMovingAverage::new(50).ok();
        let mut macd = MovingAverageConvergenceDivergence::new(12, 26, 9).ok();
        let mut bb = BollingerBands::new(20, 2.0).ok();

        let (mut last_ema12, mut last_ema26, mut last_ema50) = (None, None, None);
        let mut last_macd = None;
        let mut last_bb = None;

        for &close in &closes {
            if let Some(ind) = ema12.as_mut() {
                last_ema12 = Some(ind.next(close));
            }
            if let Some(ind) = ema26.as_mut() {
                last_ema26 = Some(ind.next(close));
            }
            if let Some(ind) = ema50.as_mut() {
                last_ema50 = Some(ind.next(close));
            }
            if let Some(ind) = macd.as_mut() {
                last_macd = Some(ind.next(close));
            }
            if let Some(ind) = bb.as_mut() {
                last_bb = Some(ind.next(close));
            }
        }

        insert_if_finite(&mut values, "ema_12", last_ema12);
        insert_if_finite(&mut values, "ema_26", last_ema26);
        insert_if_finite(&mut values, "ema_50", last_ema50);
        if let Some(out) = last_macd {
            insert_if_finite(&mut values, "macd", Some(out.macd));
            insert_if_finite(&mut values, "macd_signal", Some(out.signal));
            insert_if_finite(&mut values, "macd_histogram", Some(out.histogram));
        }
        if let Some(out) = last_bb {
            insert_if_finite(&mut values, "bb_middle", Some(out.average));
            insert_if_finite(&mut values, "bb_upper", Some(out.upper));
            insert_if_finite(&mut values, "bb_lower", Some(out.lower));
        }
        if let Some(rsi) = simple_rsi(&closes, 14) {
            insert_if_finite(&mut values, "rsi", Some(rsi));
        }

        let change_pct = if closes.len() >= 2 {
            let prev = closes[closes.len() - 2];
            let last = closes[closes.len() - 1];
            if prev == 0.0 { 0.0 } else { (last - prev) / prev }
        } else {
            0.0
        };
        values.insert("change_pct".to_string(), change_pct);

        let last = candles.last().unwrap();
        let first = candles.first().unwrap();
        let mut meta = HashMap::new();
        meta.insert("group_by_key".to_string(), MetaValue::from(format!("interval_{interval}").as_str()));
        meta.insert("interval".to_string(), MetaValue::from(interval));
        meta.insert("count".to_string(), MetaValue::from(candles.len() as i64));
        meta.insert("window_start_ts".to_string(), MetaValue::from(first.ts_ms));
        meta.insert("window_end_ts".to_string(), MetaValue::from(last.ts_ms));

        Some(FeatureVector {
            ts_ms: last.ts_ms,
            instrument: instrument.clone(),
            values,
            meta,
        })
    }
}

fn insert_if_finite(values: &mut HashMap<String, f64>, key: &str, v: Option<f64>) {
    if let Some(v) = v {
        if v.is_finite() {
            values.insert(key.to_string(), v);
        }
        // NaN/infinite values are emitted as absent rather than propagated.
    }
}

/// RSI(14) using simple rolling means of gains/losses (not Wilder
/// smoothing): `100 - 100/(1 + avg_gain/avg_loss)`. A zero average loss
/// yields an infinite ratio and RSI saturates to 100.
fn simple_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - period - 1..];
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gain_sum += delta;
        } else {
            loss_sum += -delta;
        }
    }
    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Builds one `FeatureVector` per symbol from the latest market snapshot,
/// extracting the fixed set of aliased keys.
pub struct MarketSnapshotComputer;

impl MarketSnapshotComputer {
    pub fn compute(
        instrument: &InstrumentRef,
        ts_ms: i64,
        snapshot: &MarketSnapshot,
    ) -> FeatureVector {
        let mut values = HashMap::new();

        for key in ["last", "open", "high", "low", "bid", "ask", "volume", "change_pct"] {
            if let Some(v) = snapshot.price.get(key).copied() {
                values.insert(format!("price.{key}"), v);
            }
        }

        // Fall back to the venue's raw `info` fields when the unified keys
        // above are missing (some venues only populate their native fields).
        if !values.contains_key("price.high") {
            for (info_key, feature_key) in [
                ("high_24h", "price.high"),
                ("low_24h", "price.low"),
                ("best_bid", "price.bid"),
                ("best_ask", "price.ask"),
            ] {
                if !values.contains_key(feature_key) {
                    if let Some(v) = snapshot.info.get(info_key).copied() {
                        if v != 0.0 {
                            values.insert(feature_key.to_string(), v);
                        }
                    }
                }
            }
        }
        if !values.contains_key("price.volume") {
            for info_key in ["volume_24h", "base_volume"] {
                if let Some(v) = snapshot.info.get(info_key).copied() {
                    if v != 0.0 {
                        values.insert("price.volume".to_string(), v);
                        break;
                    }
                }
            }
        }

        if let Some(oi) = &snapshot.open_interest {
            for key in ["openInterest", "openInterestAmount", "baseVolume"] {
                if let Some(v) = oi.get(key).copied() {
                    values.insert("open_interest".to_string(), v);
                    break;
                }
            }
        }

        if let Some(funding) = &snapshot.funding_rate {
            if let Some(v) = funding.get("fundingRate").or_else(|| funding.get("rate")) {
                values.insert("funding.rate".to_string(), *v);
            }
            if let Some(v) = funding.get("markPrice").or_else(|| funding.get("mark_price")) {
                values.insert("funding.mark_price".to_string(), *v);
            }
        }

        let mut meta = HashMap::new();
        meta.insert("group_by_key".to_string(), MetaValue::from("market_snapshot"));

        FeatureVector {
            ts_ms,
            instrument: instrument.clone(),
            values,
            meta,
        }
    }
}

/// Default pipeline: medium candles + micro candles + market snapshot,
/// concatenated in that order. Delegates candle/snapshot fetching to the
/// market data source, falling back to the execution gateway's
/// `fetch_ohlcv`/`fetch_ticker` when the source can't serve a symbol
/// directly.
pub struct DefaultFeaturesPipeline {
    market_data: std::sync::Arc<dyn MarketDataSource>,
    execution_gateway: std::sync::Arc<dyn ExecutionGateway>,
}

impl DefaultFeaturesPipeline {
    pub fn new(
        market_data: std::sync::Arc<dyn MarketDataSource>,
        execution_gateway: std::sync::Arc<dyn ExecutionGateway>,
    ) -> Self {
        Self {
            market_data,
            execution_gateway,
        }
    }

    pub async fn build(&self, symbols: &[String]) -> Vec<FeatureVector> {
        let mut out = Vec::new();

        for (interval, lookback) in [(MEDIUM_INTERVAL, MEDIUM_WINDOW), (MICRO_INTERVAL, MICRO_WINDOW)] {
            let candles = match self.market_data.get_recent_candles(symbols, interval, lookback).await {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(interval, error = %err, "market data source failed for interval, falling back to gateway");
                    let mut fallback = Vec::new();
                    for symbol in symbols {
                        match self.execution_gateway.fetch_ohlcv(symbol, interval, lookback).await {
                            Ok(c) => fallback.extend(c),
                            Err(err) => {
                                tracing::warn!(symbol, interval, error = %err, "gateway fallback fetch_ohlcv failed");
                            }
                        }
                    }
                    fallback
                }
            };

            for symbol in symbols {
                let instrument = InstrumentRef::new(symbol.clone());
                let mut symbol_candles: Vec<Candle> = candles
                    .iter()
                    .filter(|c| c.instrument.symbol == *symbol)
                    .cloned()
                    .collect();
                symbol_candles.sort_by_key(|c| c.ts_ms);
                if let Some(fv) = CandleFeatureComputer::compute(&instrument, &symbol_candles, interval) {
                    out.push(fv);
                }
            }
        }

        let snapshots = match self.market_data.get_market_snapshot(symbols).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "market snapshot fetch failed for this cycle");
                HashMap::new()
            }
        };
        let ts = crate::domain::types::now_ms();
        for symbol in symbols {
            if let Some(snapshot) = snapshots.get(symbol) {
                let instrument = InstrumentRef::new(symbol.clone());
                out.push(MarketSnapshotComputer::compute(&instrument, ts, snapshot));
            } else if let Ok(Some(price)) = self.execution_gateway.fetch_ticker(symbol).await {
                let instrument = InstrumentRef::new(symbol.clone());
                let mut snapshot = MarketSnapshot::default();
                snapshot.price.insert("last".to_string(), price);
                out.push(MarketSnapshotComputer::compute(&instrument, ts, &snapshot));
            }
        }

        out
    }
}

/// Groups a flat feature list by `meta.group_by_key`, matching the grouping
/// the LLM composer feeds into its prompt payload.
pub fn group_features(features: &[FeatureVector]) -> HashMap<String, Vec<&FeatureVector>> {
    let mut groups: HashMap<String, Vec<&FeatureVector>> = HashMap::new();
    for fv in features {
        let key = fv.group_by_key().unwrap_or("ungrouped").to_string();
        groups.entry(key).or_default().push(fv);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            ts_ms: ts,
            instrument: InstrumentRef::new("BTC-USDT"),
            open: dec!(0),
            high: dec!(0),
            low: dec!(0),
            close: rust_decimal::Decimal::try_from(close).unwrap(),
            volume: dec!(0),
            interval: "1m".to_string(),
        }
    }

    #[test]
    fn rsi_all_gains_window_saturates_to_100() {
        let closes: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        let rsi = simple_rsi(&closes, 14).unwrap();
        assert!((rsi - 100.0).abs() < 1e-9);
    }

    #[test]
    fn candle_feature_computer_emits_change_pct() {
        let instrument = InstrumentRef::new("BTC-USDT");
        let candles: Vec<Candle> = (0..30).map(|i| candle(i * 60_000, 100.0 + i as f64)).collect();
        let fv = CandleFeatureComputer::compute(&instrument, &candles, "1m").unwrap();
        assert!(fv.values.contains_key("change_pct"));
        assert_eq!(fv.interval(), Some("1m"));
    }

    #[test]
    fn empty_candles_yield_no_feature_vector() {
        let instrument = InstrumentRef::new("BTC-USDT");
        assert!(CandleFeatureComputer::compute(&instrument, &[], "1m").is_none());
    }

    #[test]
    fn market_snapshot_falls_back_to_info_fields_when_unified_price_missing() {
        let instrument = InstrumentRef::new("BTC-USDT");
        let mut snapshot = MarketSnapshot::default();
        snapshot.price.insert("last".to_string(), 100.0);
        snapshot.info.insert("high_24h".to_string(), 105.0);
        snapshot.info.insert("low_24h".to_string(), 95.0);
        snapshot.info.insert("best_bid".to_string(), 99.5);
        snapshot.info.insert("best_ask".to_string(), 100.5);
        snapshot.info.insert("volume_24h".to_string(), 12345.0);

        let fv = MarketSnapshotComputer::compute(&instrument, 0, &snapshot);
        assert_eq!(fv.values.get("price.high"), Some(&105.0));
        assert_eq!(fv.values.get("price.low"), Some(&95.0));
        assert_eq!(fv.values.get("price.bid"), Some(&99.5));
        assert_eq!(fv.values.get("price.ask"), Some(&100.5));
        assert_eq!(fv.values.get("price.volume"), Some(&12345.0));
    }

    #[test]
    fn market_snapshot_prefers_unified_price_over_info_fallback() {
        let instrument = InstrumentRef::new("BTC-USDT");
        let mut snapshot = MarketSnapshot::default();
        snapshot.price.insert("high".to_string(), 200.0);
        snapshot.info.insert("high_24h".to_string(), 999.0);

        let fv = MarketSnapshotComputer::compute(&instrument, 0, &snapshot);
        assert_eq!(fv.values.get("price.high"), Some(&200.0));
    }
}
