//! Shared plan-normalization core, ported from the
//! reference `BaseComposer` helpers. Both the grid and LLM composers build a
//! `TradePlanProposal` and hand it to `normalize_plan`, which is the only
//! place guardrails (position/leverage caps, buying power, filters) are
//! enforced.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde_json::json;

use crate::domain::request::UserRequest;
use crate::domain::types::{
    ComposeContext, Constraints, MarketType, OrderSide, PriceMode, TradeDecisionAction,
    TradeDecisionItem, TradeInstruction, TradePlanProposal, TxResult, TxStatus,
};

pub struct GuardrailParams {
    pub default_slippage_bps: u32,
    pub quantity_precision: Decimal,
    /// Fraction of equity*leverage usable as gross exposure cap per symbol.
    pub cap_factor: Decimal,
}

impl Default for GuardrailParams {
    fn default() -> Self {
        Self {
            default_slippage_bps: 25,
            quantity_precision: Decimal::new(1, 9),
            cap_factor: Decimal::new(15, 1), // 1.5
        }
    }
}

/// Mutable per-cycle projection state, threaded through item-by-item
/// normalization so later items see the effect of earlier ones (step j).
struct Projection {
    positions: HashMap<String, Decimal>,
    projected_gross: Decimal,
    active_positions: u32,
}

pub struct BuyingPowerContext {
    pub equity: Decimal,
    pub allowed_leverage: Decimal,
    pub constraints: Constraints,
    pub projected_gross: Decimal,
    pub price_map: HashMap<String, Decimal>,
}

pub fn init_buying_power_context(context: &ComposeContext) -> BuyingPowerContext {
    let portfolio = &context.portfolio;
    let price_map = crate::application::portfolio_service::InMemoryPortfolioService::price_map(&context.features);
    BuyingPowerContext {
        equity: portfolio.total_value,
        allowed_leverage: portfolio.constraints.max_leverage.unwrap_or(Decimal::ONE),
        constraints: portfolio.constraints.clone(),
        projected_gross: portfolio.gross_exposure,
        price_map,
    }
}

/// Normalizes a raw plan proposal into guardrail-passed, executable
/// instructions. This is the single choke point every composer variant
/// shares.
pub fn normalize_plan(
    request: &UserRequest,
    params: &GuardrailParams,
    context: &ComposeContext,
    plan: &TradePlanProposal,
) -> (Vec<TradeInstruction>, Vec<TxResult>) {
    let bp = init_buying_power_context(context);
    let is_spot = request.exchange_config.market_type == MarketType::Spot;

    let mut projection = Projection {
        positions: context
            .portfolio
            .positions
            .iter()
            .map(|(k, v)| (k.clone(), v.quantity))
            .collect(),
        projected_gross: bp.projected_gross,
        active_positions: context
            .portfolio
            .positions
            .values()
            .filter(|p| !p.quantity.is_zero())
            .count() as u32,
    };

    let mut instructions = Vec::new();
    let mut rejected = Vec::new();

    for (item_idx, item) in plan.items.iter().enumerate() {
        if item.action == TradeDecisionAction::Noop {
            continue;
        }
        let symbol = item.instrument.symbol.clone();
        let current = projection.positions.get(&symbol).copied().unwrap_or(Decimal::ZERO);

        // (a) resolve signed target from action + current + requested magnitude.
        let mut target = resolve_target(item, current, is_spot);
        if let Some(max_pos) = bp.constraints.max_position_qty {
            target = target.clamp(-max_pos, max_pos);
        }
        if is_spot {
            target = target.max(Decimal::ZERO);
        }

        // (b) never flip directly: split into [0, target] sub-steps.
        let steps: Vec<(Decimal, usize)> = if current.signum() != Decimal::ZERO
            && target.signum() != Decimal::ZERO
            && current.signum() != target.signum()
        {
            vec![(Decimal::ZERO, 0), (target, 1)]
        } else {
            vec![(target, 0)]
        };

        let mut running_current = current;
        for (sub_target, sub_step) in steps {
            // (c) delta / precision skip.
            let delta = sub_target - running_current;
            if delta.abs() <= params.quantity_precision {
                continue;
            }

            // (d) max_positions enforcement on flat -> non-flat transitions.
            if running_current.is_zero() && !sub_target.is_zero() {
                if let Some(max_positions) = bp.constraints.max_positions {
                    if projection.active_positions >= max_positions {
                        continue;
                    }
                }
            }

            // (e) side + leverage.
            let side = if delta > Decimal::ZERO { OrderSide::Buy } else { OrderSide::Sell };
            let leverage = if is_spot {
                Decimal::ONE
            } else {
                item.leverage
                    .unwrap_or(Decimal::ONE)
                    .clamp(Decimal::ONE, bp.allowed_leverage)
            };

            let price = bp.price_map.get(&symbol).copied();

            // (f) per-order filters.
            let mut qty = delta.abs();
            if let Some(step) = bp.constraints.quantity_step.filter(|s| !s.is_zero()) {
                qty = (qty / step).floor() * step;
            }
            let mut reject_reason: Option<String> = None;
            if let Some(min_qty) = bp.constraints.min_trade_qty {
                if qty < min_qty {
                    reject_reason = Some(format!("{qty:.4} < min_qty={min_qty}"));
                }
            }
            if let Some(max_qty) = bp.constraints.max_order_qty {
                if qty > max_qty {
                    qty = max_qty;
                }
            }
            if reject_reason.is_none() {
                if let (Some(min_notional), Some(price)) = (bp.constraints.min_notional, price) {
                    if qty * price < min_notional {
                        reject_reason = Some(format!("{:.4} < min_notional={min_notional}", qty * price));
                    }
                }
            }
            if let Some(reason) = reject_reason {
                rejected.push(TxResult {
                    instruction_id: format!("{}:{}:{}", context.compose_id, symbol, item_idx * 10 + sub_step),
                    instrument: item.instrument.clone(),
                    side,
                    requested_qty: qty,
                    filled_qty: Decimal::ZERO,
                    avg_exec_price: price,
                    slippage_bps: None,
                    fee_cost: None,
                    leverage: Some(leverage),
                    status: TxStatus::Rejected,
                    reason: Some(reason),
                });
                continue;
            }
            if qty.is_zero() {
                continue;
            }

            // (g) notional/leverage cap.
            if let Some(price) = price {
                if !price.is_zero() {
                    let prospective_abs = (running_current + signed(delta.signum(), qty)).abs();
                    let cap_qty_by_factor = (params.cap_factor * bp.equity) / price;
                    let cap_qty_by_leverage = (bp.allowed_leverage * bp.equity) / price;
                    let cap_qty = cap_qty_by_factor.min(cap_qty_by_leverage);
                    if prospective_abs > cap_qty && prospective_abs > running_current.abs() {
                        let allowed_increase = (cap_qty - running_current.abs()).max(Decimal::ZERO);
                        qty = qty.min(allowed_increase);
                    }
                }
            }
            if qty.is_zero() {
                continue;
            }

            // (h) buying-power clamp with slippage buffer.
            let is_reduce = running_current.abs() > (running_current + signed(delta.signum(), qty)).abs();
            if !is_reduce {
                match price {
                    None => continue, // missing price: only reduce-only trades allowed.
                    Some(price) => {
                        let slippage_bps = item_slippage_bps(params);
                        let eff_price = price * (Decimal::ONE + Decimal::new(slippage_bps as i64, 4));
                        let avail_bp = if is_spot {
                            bp.equity.max(Decimal::ZERO)
                        } else {
                            (bp.equity * bp.allowed_leverage - projection.projected_gross).max(Decimal::ZERO)
                        };
                        if !eff_price.is_zero() {
                            let max_qty_by_bp = avail_bp / eff_price;
                            qty = qty.min(max_qty_by_bp);
                        }
                    }
                }
            }
            if qty.is_zero() {
                continue;
            }

            let final_delta = signed(delta.signum(), qty);
            let new_current = running_current + final_delta;

            let action = resolve_action(item.action, side, running_current, new_current);
            let instruction_id = format!("{}:{}:{}", context.compose_id, symbol, item_idx * 10 + sub_step);

            let mut meta = HashMap::new();
            let reduce_only = !is_spot && new_current.abs() < running_current.abs();
            meta.insert("reduceOnly".to_string(), json!(reduce_only));

            instructions.push(TradeInstruction {
                instruction_id,
                compose_id: context.compose_id.clone(),
                instrument: item.instrument.clone(),
                action,
                side,
                quantity: qty,
                leverage: Some(leverage),
                price_mode: PriceMode::Market,
                limit_price: None,
                max_slippage_bps: Some(params.default_slippage_bps),
                meta,
            });

            // (j) update projection for subsequent items.
            if let Some(price) = price {
                let prev_notional = running_current.abs() * price;
                let new_notional = new_current.abs() * price;
                projection.projected_gross = (projection.projected_gross - prev_notional + new_notional).max(Decimal::ZERO);
            }
            if running_current.is_zero() && !new_current.is_zero() {
                projection.active_positions += 1;
            } else if !running_current.is_zero() && new_current.is_zero() {
                projection.active_positions = projection.active_positions.saturating_sub(1);
            }
            running_current = new_current;
        }

        projection.positions.insert(symbol, running_current);
    }

    (instructions, rejected)
}

fn item_slippage_bps(params: &GuardrailParams) -> u32 {
    params.default_slippage_bps
}

fn signed(sign: Decimal, magnitude: Decimal) -> Decimal {
    if sign < Decimal::ZERO {
        -magnitude
    } else {
        magnitude
    }
}

/// Derives the signed final target position from the item's action and the
/// current position (step a). `target_qty` on the item is a magnitude, not a
/// signed position.
fn resolve_target(item: &TradeDecisionItem, current: Decimal, is_spot: bool) -> Decimal {
    match item.action {
        TradeDecisionAction::OpenLong => current.max(Decimal::ZERO) + item.target_qty,
        TradeDecisionAction::OpenShort => {
            if is_spot {
                current
            } else {
                current.min(Decimal::ZERO) - item.target_qty
            }
        }
        TradeDecisionAction::CloseLong => (current - item.target_qty).max(Decimal::ZERO),
        TradeDecisionAction::CloseShort => (current + item.target_qty).min(Decimal::ZERO),
        TradeDecisionAction::Noop => current,
    }
}

/// Re-derives the action tag for the emitted instruction from the
/// transition direction, so `(action, side)` stay consistent.
fn resolve_action(requested: TradeDecisionAction, side: OrderSide, from: Decimal, to: Decimal) -> TradeDecisionAction {
    if from.is_zero() && !to.is_zero() {
        return if side == OrderSide::Buy { TradeDecisionAction::OpenLong } else { TradeDecisionAction::OpenShort };
    }
    if !from.is_zero() && to.is_zero() {
        return if from > Decimal::ZERO { TradeDecisionAction::CloseLong } else { TradeDecisionAction::CloseShort };
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::{ExchangeConfig, TradingConfig, UserRequest};
    use crate::domain::types::{
        InstrumentRef, MarginMode, PortfolioView, TradeDigest, TradingMode,
    };
    use rust_decimal_macros::dec;
    use std::collections::HashMap as Map;

    fn base_request(max_leverage: f64, market_type: MarketType) -> UserRequest {
        UserRequest {
            exchange_config: ExchangeConfig {
                exchange_id: "binance".to_string(),
                trading_mode: TradingMode::Virtual,
                market_type,
                margin_mode: MarginMode::Cross,
                api_key: None,
                secret_key: None,
                passphrase: None,
                testnet: true,
            },
            trading_config: TradingConfig {
                strategy_name: "s".to_string(),
                symbols: vec!["BTC-USDT".to_string()],
                initial_capital: 10000.0,
                max_leverage: Some(max_leverage),
                max_positions: Some(5),
                decide_interval_secs: 60,
                custom_prompt: None,
                prompt_text: None,
            },
            llm_model_config: None,
        }
    }

    fn context_with_price(price: Decimal, equity: Decimal, max_leverage: Decimal) -> ComposeContext {
        let mut features = Vec::new();
        let mut values = Map::new();
        values.insert("price.last".to_string(), price.to_string().parse::<f64>().unwrap());
        features.push(crate::domain::types::FeatureVector {
            ts_ms: 0,
            instrument: InstrumentRef::new("BTC-USDT"),
            values,
            meta: Map::new(),
        });

        ComposeContext {
            ts: 0,
            compose_id: "c1".to_string(),
            strategy_id: None,
            features,
            portfolio: PortfolioView {
                strategy_id: None,
                ts_ms: 0,
                account_balance: equity,
                positions: Map::new(),
                gross_exposure: Decimal::ZERO,
                net_exposure: Decimal::ZERO,
                total_value: equity,
                total_unrealized_pnl: Decimal::ZERO,
                total_realized_pnl: Decimal::ZERO,
                buying_power: equity,
                free_cash: equity,
                constraints: Constraints {
                    max_leverage: Some(max_leverage),
                    max_positions: Some(5),
                    ..Default::default()
                },
            },
            digest: TradeDigest::default(),
        }
    }

    #[test]
    fn leverage_cap_clamps_quantity() {
        let request = base_request(5.0, MarketType::Swap);
        let context = context_with_price(dec!(100), dec!(10000), dec!(5));
        let plan = TradePlanProposal {
            ts: 0,
            items: vec![TradeDecisionItem {
                instrument: InstrumentRef::new("BTC-USDT"),
                action: TradeDecisionAction::OpenLong,
                target_qty: dec!(1000),
                leverage: Some(dec!(5)),
                confidence: None,
                rationale: None,
            }],
            rationale: None,
        };
        let (instructions, rejected) = normalize_plan(&request, &GuardrailParams::default(), &context, &plan);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].quantity, dec!(150));
        assert!(rejected.is_empty());
    }

    #[test]
    fn min_notional_rejects() {
        let request = base_request(1.0, MarketType::Spot);
        let mut context = context_with_price(dec!(1), dec!(10000), dec!(1));
        context.portfolio.constraints.min_notional = Some(dec!(10));
        let plan = TradePlanProposal {
            ts: 0,
            items: vec![TradeDecisionItem {
                instrument: InstrumentRef::new("BTC-USDT"),
                action: TradeDecisionAction::OpenLong,
                target_qty: dec!(5),
                leverage: None,
                confidence: None,
                rationale: None,
            }],
            rationale: None,
        };
        let (instructions, rejected) = normalize_plan(&request, &GuardrailParams::default(), &context, &plan);
        assert!(instructions.is_empty());
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].status, TxStatus::Rejected);
        assert_eq!(rejected[0].reason.as_deref(), Some("5.0000 < min_notional=10"));
    }

    #[test]
    fn direction_flip_splits_into_two_instructions() {
        let request = base_request(5.0, MarketType::Swap);
        let mut context = context_with_price(dec!(100), dec!(10000), dec!(5));
        context.portfolio.positions.insert(
            "BTC-USDT".to_string(),
            crate::domain::types::PositionSnapshot {
                instrument: InstrumentRef::new("BTC-USDT"),
                quantity: dec!(-3),
                avg_price: Some(dec!(100)),
                mark_price: Some(dec!(100)),
                unrealized_pnl: None,
                unrealized_pnl_pct: None,
                notional: None,
                leverage: Some(dec!(1)),
                entry_ts: Some(0),
                closed_ts: None,
                trade_type: Some(crate::domain::types::TradeType::Short),
            },
        );
        let plan = TradePlanProposal {
            ts: 0,
            items: vec![TradeDecisionItem {
                instrument: InstrumentRef::new("BTC-USDT"),
                action: TradeDecisionAction::OpenLong,
                target_qty: dec!(5),
                leverage: Some(dec!(1)),
                confidence: None,
                rationale: None,
            }],
            rationale: None,
        };
        let (instructions, rejected) = normalize_plan(&request, &GuardrailParams::default(), &context, &plan);
        assert!(rejected.is_empty());
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].quantity, dec!(3));
        assert_eq!(instructions[0].side, OrderSide::Buy);
        assert_eq!(instructions[1].quantity, dec!(5));
        assert_eq!(instructions[1].side, OrderSide::Buy);
    }
}
