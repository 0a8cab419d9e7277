//! In-memory portfolio accounting. Ported from the
//! reference `InMemoryPortfolioService.apply_trades` algorithm: position
//! weighted-average tracking, direction-flip resets, spot vs. derivatives
//! cash/equity/buying-power formulas.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::domain::types::{
    Constraints, FeatureVector, InstrumentRef, MarketType, PortfolioView, PositionSnapshot,
    TradeHistoryEntry, TradeType, TradingMode,
};

pub struct InMemoryPortfolioService {
    trading_mode: TradingMode,
    market_type: MarketType,
    cash: Decimal,
    view: PortfolioView,
}

impl InMemoryPortfolioService {
    pub fn new(
        strategy_id: String,
        initial_capital: Decimal,
        trading_mode: TradingMode,
        market_type: MarketType,
        constraints: Constraints,
    ) -> Self {
        let view = PortfolioView {
            strategy_id: Some(strategy_id),
            ts_ms: crate::domain::types::now_ms(),
            account_balance: initial_capital,
            positions: HashMap::new(),
            gross_exposure: Decimal::ZERO,
            net_exposure: Decimal::ZERO,
            total_value: initial_capital,
            total_unrealized_pnl: Decimal::ZERO,
            total_realized_pnl: Decimal::ZERO,
            buying_power: initial_capital,
            free_cash: initial_capital,
            constraints,
        };
        Self {
            trading_mode,
            market_type,
            cash: initial_capital,
            view,
        }
    }

    pub fn get_view(&self) -> PortfolioView {
        self.view.clone()
    }

    pub fn trading_mode(&self) -> TradingMode {
        self.trading_mode
    }

    pub fn market_type(&self) -> MarketType {
        self.market_type
    }

    /// Replaces the current position book wholesale, used by the LIVE
    /// balance-sync step in the coordinator when rebuilding
    /// positions from the venue.
    pub fn replace_positions(&mut self, positions: HashMap<String, PositionSnapshot>) {
        self.view.positions = positions;
    }

    pub fn set_cash(&mut self, cash: Decimal) {
        self.cash = cash;
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Price map preferring `price.last`, then `price.close`, `price.mark`,
    /// `funding.mark_price`.
    pub fn price_map(features: &[FeatureVector]) -> HashMap<String, Decimal> {
        let mut map = HashMap::new();
        for fv in features {
            let symbol = fv.instrument.symbol.clone();
            let price = fv
                .values
                .get("price.last")
                .or_else(|| fv.values.get("price.close"))
                .or_else(|| fv.values.get("price.mark"))
                .or_else(|| fv.values.get("funding.mark_price"))
                .copied();
            if let Some(price) = price {
                if let Ok(price) = Decimal::try_from(price) {
                    map.entry(symbol).or_insert(price);
                }
            }
        }
        map
    }

    pub fn apply_trades(&mut self, trades: &[TradeHistoryEntry], market_features: &[FeatureVector]) {
        let price_map = Self::price_map(market_features);
        let is_spot = self.market_type.is_spot();

        for trade in trades {
            let symbol = trade.instrument.symbol.clone();
            let fill_price = trade
                .avg_exec_price
                .or(trade.exit_price)
                .or_else(|| price_map.get(&symbol).copied())
                .or(trade.entry_price)
                .unwrap_or(Decimal::ZERO);
            let fill_ts = trade.exit_ts.or(trade.entry_ts).unwrap_or(trade.trade_ts.unwrap_or(0));

            let side_sign = match trade.side {
                Some(crate::domain::types::OrderSide::Buy) => Decimal::ONE,
                Some(crate::domain::types::OrderSide::Sell) => -Decimal::ONE,
                None => Decimal::ZERO,
            };
            let signed_delta = side_sign * trade.quantity.abs();

            let position = self
                .view
                .positions
                .entry(symbol.clone())
                .or_insert_with(|| PositionSnapshot::flat(trade.instrument.clone()));

            let current_qty = position.quantity;
            let new_qty = current_qty + signed_delta;

            let mut realized: Decimal = Decimal::ZERO;

            if current_qty.signum() != Decimal::ZERO
                && signed_delta.signum() != Decimal::ZERO
                && current_qty.signum() != signed_delta.signum()
            {
                // Reducing or flipping: realize PnL on the reduced portion.
                let reduction = signed_delta.abs().min(current_qty.abs());
                if let Some(explicit) = trade.realized_pnl {
                    realized = explicit;
                } else if let Some(avg) = position.avg_price {
                    realized = match trade.trade_type.or(position.trade_type) {
                        Some(TradeType::Short) => (avg - fill_price) * reduction,
                        _ => (fill_price - avg) * reduction,
                    };
                    if let Some(fee) = trade.fee_cost {
                        let fee_share = fee * (reduction / trade.quantity.abs().max(Decimal::new(1, 9)));
                        realized -= fee_share;
                    }
                }
            }

            if new_qty.is_zero() {
                position.closed_ts = Some(fill_ts);
                position.unrealized_pnl = Some(Decimal::ZERO);
                position.unrealized_pnl_pct = Some(Decimal::ZERO);
                position.quantity = Decimal::ZERO;
            } else if current_qty.is_zero() {
                position.avg_price = Some(fill_price);
                position.entry_ts = Some(fill_ts);
                position.trade_type = Some(if new_qty > Decimal::ZERO { TradeType::Long } else { TradeType::Short });
                position.leverage = trade.leverage;
                position.closed_ts = None;
                position.quantity = new_qty;
            } else if current_qty.signum() == new_qty.signum() && new_qty.abs() > current_qty.abs() {
                // Same-direction increase: size-weighted average.
                let prev_avg = position.avg_price.unwrap_or(fill_price);
                let prev_abs = current_qty.abs();
                let delta_abs = signed_delta.abs();
                let new_abs = new_qty.abs();
                position.avg_price = Some((prev_abs * prev_avg + delta_abs * fill_price) / new_abs);
                position.leverage = match (position.leverage, trade.leverage) {
                    (Some(prev_lev), Some(new_lev)) => {
                        Some((prev_abs * prev_lev + delta_abs * new_lev) / new_abs)
                    }
                    (prev, new) => prev.or(new),
                };
                position.quantity = new_qty;
            } else if current_qty.signum() == new_qty.signum() {
                // Same-direction reduction: avg_price unchanged.
                position.quantity = new_qty;
            } else {
                // Direction flip across zero.
                position.avg_price = Some(fill_price);
                position.entry_ts = Some(fill_ts);
                position.trade_type = Some(if new_qty > Decimal::ZERO { TradeType::Long } else { TradeType::Short });
                position.leverage = trade.leverage;
                position.closed_ts = None;
                position.quantity = new_qty;
            }

            self.view.total_realized_pnl += realized;

            if is_spot {
                let notional = fill_price * trade.quantity.abs();
                match trade.side {
                    Some(crate::domain::types::OrderSide::Buy) => self.cash -= notional,
                    Some(crate::domain::types::OrderSide::Sell) => self.cash += notional,
                    None => {}
                }
            }
            if let Some(fee) = trade.fee_cost {
                self.cash -= fee;
            }
            if !is_spot {
                self.cash += realized;
            }
        }

        self.recompute(&price_map);
    }

    fn recompute(&mut self, price_map: &HashMap<String, Decimal>) {
        let is_spot = self.market_type.is_spot();
        let mut gross = Decimal::ZERO;
        let mut net = Decimal::ZERO;
        let mut total_unrealized = Decimal::ZERO;
        let mut margin_used = Decimal::ZERO;

        for (symbol, position) in self.view.positions.iter_mut() {
            let mark = price_map.get(symbol).copied().or(position.mark_price).unwrap_or(
                position.avg_price.unwrap_or(Decimal::ZERO),
            );
            position.mark_price = Some(mark);

            if position.quantity.is_zero() {
                continue;
            }

            let avg = position.avg_price.unwrap_or(mark);
            let notional = position.quantity.abs() * mark;
            let unrealized = (mark - avg) * position.quantity;
            position.notional = Some(notional);
            position.unrealized_pnl = Some(unrealized);
            position.unrealized_pnl_pct = if !avg.is_zero() && !position.quantity.is_zero() {
                Some(unrealized / (position.quantity.abs() * avg) * Decimal::new(100, 0))
            } else {
                None
            };

            gross += notional;
            net += position.quantity * mark;
            total_unrealized += unrealized;
            if let Some(lev) = position.leverage.filter(|l| *l >= Decimal::ONE) {
                margin_used += notional / lev;
            } else {
                margin_used += notional;
            }
        }

        self.view.gross_exposure = gross;
        self.view.net_exposure = net;
        self.view.total_unrealized_pnl = total_unrealized;

        let equity = if is_spot {
            self.cash + net
        } else {
            self.cash + total_unrealized
        };
        self.view.total_value = equity;
        self.view.account_balance = self.cash;

        let max_leverage = self.view.constraints.max_leverage.unwrap_or(Decimal::ONE);
        self.view.buying_power = if is_spot {
            self.cash.max(Decimal::ZERO)
        } else {
            (equity * max_leverage - gross).max(Decimal::ZERO)
        };
        self.view.free_cash = if is_spot {
            self.cash.max(Decimal::ZERO)
        } else {
            (equity - margin_used).max(Decimal::ZERO)
        };

        self.view.ts_ms = crate::domain::types::now_ms();
    }

    pub fn instrument(&self, symbol: &str) -> InstrumentRef {
        self.view
            .positions
            .get(symbol)
            .map(|p| p.instrument.clone())
            .unwrap_or_else(|| InstrumentRef::new(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{InstrumentRef, OrderSide};
    use rust_decimal_macros::dec;

    fn make_service(capital: Decimal, market_type: MarketType) -> InMemoryPortfolioService {
        InMemoryPortfolioService::new(
            "s1".to_string(),
            capital,
            TradingMode::Virtual,
            market_type,
            Constraints {
                max_leverage: Some(dec!(5)),
                ..Default::default()
            },
        )
    }

    fn trade(symbol: &str, side: OrderSide, qty: Decimal, price: Decimal) -> TradeHistoryEntry {
        TradeHistoryEntry {
            trade_id: "t1".to_string(),
            compose_id: None,
            instruction_id: None,
            instrument: InstrumentRef::new(symbol.to_string()),
            trade_type: None,
            side: Some(side),
            leverage: Some(dec!(1)),
            quantity: qty,
            entry_price: Some(price),
            exit_price: None,
            avg_exec_price: Some(price),
            unrealized_pnl: None,
            realized_pnl: None,
            realized_pnl_pct: None,
            notional_entry: None,
            notional_exit: None,
            fee_cost: None,
            entry_ts: Some(1),
            exit_ts: None,
            trade_ts: Some(1),
            holding_ms: None,
            note: None,
        }
    }

    #[test]
    fn spot_round_trip_realizes_pnl_on_close() {
        let mut svc = make_service(dec!(10000), MarketType::Spot);
        svc.apply_trades(&[trade("BTC-USDT", OrderSide::Buy, dec!(0.1), dec!(20000))], &[]);
        let pos = svc.get_view().positions.get("BTC-USDT").cloned().unwrap();
        assert_eq!(pos.quantity, dec!(0.1));
        assert_eq!(pos.avg_price, Some(dec!(20000)));

        let mut close = trade("BTC-USDT", OrderSide::Sell, dec!(0.1), dec!(22000));
        close.exit_ts = Some(2);
        svc.apply_trades(&[close], &[]);
        let pos = svc.get_view().positions.get("BTC-USDT").cloned().unwrap();
        assert!(pos.quantity.is_zero());
        assert!(pos.closed_ts.is_some());
        assert_eq!(svc.get_view().total_realized_pnl, dec!(200));
    }

    #[test]
    fn spot_equity_equals_cash_plus_net_exposure() {
        let mut svc = make_service(dec!(10000), MarketType::Spot);
        svc.apply_trades(&[trade("ETH-USDT", OrderSide::Buy, dec!(1), dec!(1000))], &[]);
        let view = svc.get_view();
        assert_eq!(view.total_value, view.account_balance + view.net_exposure);
    }
}
