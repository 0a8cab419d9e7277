//! Simulated fills for paper/virtual trading. Every
//! instruction fills in full at a slipped reference price; fees are a flat
//! bps of notional.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::ports::{BalanceEntry, ExecutionGateway};
use crate::domain::types::{
    Candle, MarketSnapshot, OrderSide, PositionSnapshot, TradeInstruction, TxResult, TxStatus,
};

pub struct PaperExecutionGateway {
    fee_bps: Decimal,
    last_prices: RwLock<HashMap<String, Decimal>>,
}

impl PaperExecutionGateway {
    pub fn new(fee_bps: Decimal) -> Self {
        Self {
            fee_bps,
            last_prices: RwLock::new(HashMap::new()),
        }
    }

    fn reference_price(&self, symbol: &str, market_snapshot: Option<&HashMap<String, MarketSnapshot>>) -> Option<Decimal> {
        if let Some(snapshot) = market_snapshot.and_then(|m| m.get(symbol)) {
            if let Some(price) = snapshot.price.get("last").copied() {
                if let Ok(price) = Decimal::try_from(price) {
                    self.last_prices.write().unwrap().insert(symbol.to_string(), price);
                    return Some(price);
                }
            }
        }
        self.last_prices.read().unwrap().get(symbol).copied()
    }
}

#[async_trait]
impl ExecutionGateway for PaperExecutionGateway {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_snapshot: Option<&HashMap<String, MarketSnapshot>>,
    ) -> Result<Vec<TxResult>> {
        let mut results = Vec::with_capacity(instructions.len());
        for instr in instructions {
            if instr.action == crate::domain::types::TradeDecisionAction::Noop {
                results.push(TxResult {
                    instruction_id: instr.instruction_id.clone(),
                    instrument: instr.instrument.clone(),
                    side: instr.side,
                    requested_qty: instr.quantity,
                    filled_qty: Decimal::ZERO,
                    avg_exec_price: None,
                    slippage_bps: None,
                    fee_cost: None,
                    leverage: instr.leverage,
                    status: TxStatus::Rejected,
                    reason: Some("noop".to_string()),
                });
                continue;
            }

            let Some(reference_price) = self.reference_price(&instr.instrument.symbol, market_snapshot) else {
                results.push(TxResult {
                    instruction_id: instr.instruction_id.clone(),
                    instrument: instr.instrument.clone(),
                    side: instr.side,
                    requested_qty: instr.quantity,
                    filled_qty: Decimal::ZERO,
                    avg_exec_price: None,
                    slippage_bps: None,
                    fee_cost: None,
                    leverage: instr.leverage,
                    status: TxStatus::Rejected,
                    reason: Some("no reference price available".to_string()),
                });
                continue;
            };

            let slippage_bps = instr.max_slippage_bps.unwrap_or(25);
            let slip = Decimal::new(slippage_bps as i64, 4);
            // BUY slips up, SELL slips down: both directions cost the taker.
            let exec_price = match instr.side {
                OrderSide::Buy => reference_price * (Decimal::ONE + slip),
                OrderSide::Sell => reference_price * (Decimal::ONE - slip),
            };
            let fee_cost = exec_price * instr.quantity * (self.fee_bps / Decimal::new(10000, 0));

            results.push(TxResult {
                instruction_id: instr.instruction_id.clone(),
                instrument: instr.instrument.clone(),
                side: instr.side,
                requested_qty: instr.quantity,
                filled_qty: instr.quantity,
                avg_exec_price: Some(exec_price),
                slippage_bps: Some(slippage_bps as f64),
                fee_cost: Some(fee_cost),
                leverage: instr.leverage,
                status: TxStatus::Filled,
                reason: None,
            });
        }
        Ok(results)
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, BalanceEntry>> {
        Ok(HashMap::new())
    }

    async fn fetch_positions(&self, _symbols: Option<&[String]>) -> Result<Vec<PositionSnapshot>> {
        Ok(Vec::new())
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<()> {
        Ok(())
    }

    async fn fetch_open_orders(&self, _symbol: Option<&str>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Option<f64>> {
        Ok(self.last_prices.read().unwrap().get(symbol).and_then(|d| d.to_string().parse().ok()))
    }

    async fn fetch_ohlcv(&self, _symbol: &str, _interval: &str, _lookback: usize) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{InstrumentRef, PriceMode, TradeDecisionAction};
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str, price: f64) -> HashMap<String, MarketSnapshot> {
        let mut map = HashMap::new();
        let mut s = MarketSnapshot::default();
        s.price.insert("last".to_string(), price);
        map.insert(symbol.to_string(), s);
        map
    }

    #[tokio::test]
    async fn fills_at_slipped_price() {
        let gw = PaperExecutionGateway::new(dec!(10));
        let instr = TradeInstruction {
            instruction_id: "c1:BTC-USDT:0".to_string(),
            compose_id: "c1".to_string(),
            instrument: InstrumentRef::new("BTC-USDT"),
            action: TradeDecisionAction::OpenLong,
            side: OrderSide::Buy,
            quantity: dec!(0.1),
            leverage: Some(dec!(1)),
            price_mode: PriceMode::Market,
            limit_price: None,
            max_slippage_bps: Some(25),
            meta: HashMap::new(),
        };
        let snap = snapshot("BTC-USDT", 20000.0);
        let results = gw.execute(&[instr], Some(&snap)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TxStatus::Filled);
        assert!(results[0].avg_exec_price.unwrap() > dec!(20000));
    }
}
