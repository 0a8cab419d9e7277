//! Rule-based mean-reversion grid composer. Ported from the reference
//! `GridComposer`: avoids LLM usage entirely,
//! trading purely on `change_pct` thresholds and grid steps from the
//! position's average price, then reuses `guardrails::normalize_plan` for
//! risk controls.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::application::composer::guardrails::{self, GuardrailParams};
use crate::domain::ports::Composer;
use crate::domain::request::UserRequest;
use crate::domain::types::{
    ComposeContext, ComposeResult, InstrumentRef, MarketType, TradeDecisionAction,
    TradeDecisionItem, TradePlanProposal,
};

pub struct GridComposer {
    request: UserRequest,
    params: GuardrailParams,
    step_pct: Decimal,
    max_steps: u32,
    base_fraction: Decimal,
}

impl GridComposer {
    pub fn new(request: UserRequest) -> Self {
        Self {
            request,
            params: GuardrailParams::default(),
            step_pct: Decimal::new(5, 3),     // 0.005
            max_steps: 3,
            base_fraction: Decimal::new(8, 2), // 0.08
        }
    }

    fn latest_change_pct(&self, context: &ComposeContext, symbol: &str) -> Option<f64> {
        let mut best: Option<f64> = None;
        let mut best_rank = 999;
        for fv in &context.features {
            if fv.instrument.symbol != symbol {
                continue;
            }
            let Some(change) = fv.values.get("change_pct").copied() else {
                continue;
            };
            let rank = match fv.interval() {
                Some("1s") => 0,
                Some("1m") => 1,
                _ => 2,
            };
            if rank < best_rank {
                best = Some(change);
                best_rank = rank;
            }
        }
        best
    }

    fn steps_from_avg(&self, price: Decimal, avg: Decimal) -> u32 {
        if avg.is_zero() {
            return 1;
        }
        let move_pct = (price / avg - Decimal::ONE).abs();
        let step = self.step_pct.max(Decimal::new(1, 9));
        let k = (move_pct / step).floor();
        k.min(Decimal::from(self.max_steps)).max(Decimal::ZERO).to_string().parse().unwrap_or(0)
    }
}

#[async_trait]
impl Composer for GridComposer {
    async fn compose(&self, context: &ComposeContext) -> Result<ComposeResult> {
        let bp = guardrails::init_buying_power_context(context);
        let is_spot = self.request.exchange_config.market_type == MarketType::Spot;
        let mut items = Vec::new();

        for symbol in self.request.trading_config.normalized_symbols() {
            let Some(price) = bp.price_map.get(&symbol).copied().filter(|p| !p.is_zero()) else {
                continue;
            };

            let position = context.portfolio.positions.get(&symbol);
            let qty = position.map(|p| p.quantity).unwrap_or(Decimal::ZERO);
            let avg_px = position.and_then(|p| p.avg_price).unwrap_or(Decimal::ZERO);

            let base_qty = (bp.equity * self.base_fraction / price).max(Decimal::ZERO);
            if base_qty.is_zero() {
                continue;
            }

            let instrument = InstrumentRef::with_exchange(symbol.clone(), self.request.exchange_config.exchange_id.clone());
            let max_leverage = self.request.trading_config.max_leverage.unwrap_or(1.0);
            let leverage_dec = Decimal::try_from(max_leverage).unwrap_or(Decimal::ONE).min(bp.allowed_leverage.max(Decimal::ONE));

            if qty.abs() <= self.params.quantity_precision {
                let Some(chg) = self.latest_change_pct(context, &symbol) else {
                    continue;
                };
                let step_f: f64 = self.step_pct.to_string().parse().unwrap_or(0.005);
                if chg <= -step_f {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeDecisionAction::OpenLong,
                        target_qty: base_qty,
                        leverage: Some(if is_spot { Decimal::ONE } else { leverage_dec }),
                        confidence: Some((chg.abs() / (2.0 * step_f)).min(1.0)),
                        rationale: Some(format!("Grid open-long: change_pct={chg:.4} <= -step={step_f:.4}")),
                    });
                } else if !is_spot && chg >= step_f {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeDecisionAction::OpenShort,
                        target_qty: base_qty,
                        leverage: Some(leverage_dec),
                        confidence: Some((chg.abs() / (2.0 * step_f)).min(1.0)),
                        rationale: Some(format!("Grid open-short: change_pct={chg:.4} >= step={step_f:.4}")),
                    });
                }
                continue;
            }

            let k = self.steps_from_avg(price, avg_px);
            if k == 0 {
                continue;
            }
            let k_dec = Decimal::from(k);

            if qty > Decimal::ZERO {
                let down = !avg_px.is_zero() && price <= avg_px * (Decimal::ONE - self.step_pct);
                let up = !avg_px.is_zero() && price >= avg_px * (Decimal::ONE + self.step_pct);
                if down {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeDecisionAction::OpenLong,
                        target_qty: base_qty * k_dec,
                        leverage: Some(if is_spot { Decimal::ONE } else { leverage_dec }),
                        confidence: Some((k as f64 / self.max_steps as f64).min(1.0)),
                        rationale: Some(format!("Grid long add: price {price} <= avg {avg_px} by {k} steps")),
                    });
                } else if up {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeDecisionAction::CloseLong,
                        target_qty: qty.abs().min(base_qty * k_dec),
                        leverage: Some(Decimal::ONE),
                        confidence: Some((k as f64 / self.max_steps as f64).min(1.0)),
                        rationale: Some(format!("Grid long reduce: price {price} >= avg {avg_px} by {k} steps")),
                    });
                }
            } else if qty < Decimal::ZERO {
                let up = !avg_px.is_zero() && price >= avg_px * (Decimal::ONE + self.step_pct);
                let down = !avg_px.is_zero() && price <= avg_px * (Decimal::ONE - self.step_pct);
                if up && !is_spot {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeDecisionAction::OpenShort,
                        target_qty: base_qty * k_dec,
                        leverage: Some(leverage_dec),
                        confidence: Some((k as f64 / self.max_steps as f64).min(1.0)),
                        rationale: Some(format!("Grid short add: price {price} >= avg {avg_px} by {k} steps")),
                    });
                } else if down {
                    items.push(TradeDecisionItem {
                        instrument,
                        action: TradeDecisionAction::CloseShort,
                        target_qty: qty.abs().min(base_qty * k_dec),
                        leverage: Some(Decimal::ONE),
                        confidence: Some((k as f64 / self.max_steps as f64).min(1.0)),
                        rationale: Some(format!("Grid short cover: price {price} <= avg {avg_px} by {k} steps")),
                    });
                }
            }
        }

        if items.is_empty() {
            return Ok(ComposeResult {
                instructions: Vec::new(),
                rationale: Some("Grid NOOP".to_string()),
                rejected: Vec::new(),
            });
        }

        let plan = TradePlanProposal {
            ts: context.ts,
            items,
            rationale: Some(format!(
                "Grid step={}, base_fraction={}",
                self.step_pct, self.base_fraction
            )),
        };
        let (instructions, rejected) = guardrails::normalize_plan(&self.request, &self.params, context, &plan);
        Ok(ComposeResult {
            instructions,
            rationale: plan.rationale,
            rejected,
        })
    }
}
