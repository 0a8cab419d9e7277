//! Prometheus metrics for the decision engine.
//!
//! All metrics use the `strategy_engine_` prefix and are read-only outside
//! this module; callers only ever set/increment through the methods below.

use prometheus::{CounterVec, GaugeVec, Opts, Registry, TextEncoder};

use crate::domain::ports::MetricsSink;
use crate::domain::types::TradeDecisionAction;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub portfolio_value_usd: GaugeVec,
    pub portfolio_cash_usd: GaugeVec,
    pub positions_count: GaugeVec,
    pub cycles_total: CounterVec,
    pub instructions_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let portfolio_value_usd = GaugeVec::new(
            Opts::new("strategy_engine_portfolio_value_usd", "Total portfolio value in USD"),
            &["strategy_id"],
        )?;
        registry.register(Box::new(portfolio_value_usd.clone()))?;

        let portfolio_cash_usd = GaugeVec::new(
            Opts::new("strategy_engine_portfolio_cash_usd", "Available cash in USD"),
            &["strategy_id"],
        )?;
        registry.register(Box::new(portfolio_cash_usd.clone()))?;

        let positions_count = GaugeVec::new(
            Opts::new("strategy_engine_positions_count", "Number of open positions"),
            &["strategy_id"],
        )?;
        registry.register(Box::new(positions_count.clone()))?;

        let cycles_total = CounterVec::new(
            Opts::new("strategy_engine_cycles_total", "Decision cycles completed"),
            &["strategy_id"],
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let instructions_total = CounterVec::new(
            Opts::new("strategy_engine_instructions_total", "Trade instructions executed, by action"),
            &["strategy_id", "action"],
        )?;
        registry.register(Box::new(instructions_total.clone()))?;

        Ok(Self {
            registry,
            portfolio_value_usd,
            portfolio_cash_usd,
            positions_count,
            cycles_total,
            instructions_total,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}

impl MetricsSink for Metrics {
    fn record_cycle(&self, strategy_id: &str, instructions: &[crate::domain::types::TradeInstruction], portfolio_value: f64, cash: f64, positions_count: usize) {
        self.portfolio_value_usd.with_label_values(&[strategy_id]).set(portfolio_value);
        self.portfolio_cash_usd.with_label_values(&[strategy_id]).set(cash);
        self.positions_count.with_label_values(&[strategy_id]).set(positions_count as f64);
        self.cycles_total.with_label_values(&[strategy_id]).inc();
        for instr in instructions {
            if instr.action == TradeDecisionAction::Noop {
                continue;
            }
            self.instructions_total.with_label_values(&[strategy_id, &format!("{:?}", instr.action)]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_metrics() {
        let metrics = Metrics::new().expect("metrics construction");
        metrics.portfolio_value_usd.with_label_values(&["s1"]).set(1234.5);
        let output = metrics.render();
        assert!(output.contains("strategy_engine_portfolio_value_usd"));
        assert!(output.contains("1234.5"));
    }
}
