//! LLM-driven composer. The actual model call is delegated to an injected
//! `LlmClient` — provider wiring is out of scope here, treated as an opaque
//! single-method collaborator. This module owns prompt construction, rate-limit/quota
//! detection, and best-effort webhook notification of actionable plans.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::application::composer::guardrails::{self, GuardrailParams};
use crate::application::feature_pipeline::group_features;
use crate::domain::errors::GatewayError;
use crate::domain::ports::{Composer, LlmClient, Notifier};
use crate::domain::request::UserRequest;
use crate::domain::types::{ComposeContext, ComposeResult, FeatureVector, TradeDecisionAction};

pub struct LlmComposer {
    request: UserRequest,
    client: Arc<dyn LlmClient>,
    notifier: Option<Arc<dyn Notifier>>,
    params: GuardrailParams,
}

impl LlmComposer {
    pub fn new(request: UserRequest, client: Arc<dyn LlmClient>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            request,
            client,
            notifier,
            params: GuardrailParams::default(),
        }
    }

    /// Fuses `custom_prompt` and `prompt_text`: custom first, then prompt
    /// text appended; falls back to a generated one-liner naming the
    /// symbols.
    fn build_prompt_text(&self) -> String {
        let custom = self.request.trading_config.custom_prompt.as_deref();
        let prompt = self.request.trading_config.prompt_text.as_deref();
        match (custom, prompt) {
            (Some(c), Some(p)) => format!("{c}\n\n{p}"),
            (Some(c), None) => c.to_string(),
            (None, Some(p)) => p.to_string(),
            (None, None) => format!(
                "Compose trading instructions for symbols: {}.",
                self.request.trading_config.symbols.join(", ")
            ),
        }
    }

    fn build_summary(&self, context: &ComposeContext) -> Value {
        let pv = &context.portfolio;
        let active_positions = pv.positions.values().filter(|p| !p.quantity.is_zero()).count();
        json!({
            "active_positions": active_positions,
            "total_value": pv.total_value.to_string(),
            "account_balance": pv.account_balance.to_string(),
            "free_cash": pv.free_cash.to_string(),
            "unrealized_pnl": pv.total_unrealized_pnl.to_string(),
            "sharpe_ratio": context.digest.sharpe_ratio,
        })
    }

    fn extract_market_section(&self, market_snapshot_features: &[&FeatureVector]) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for fv in market_snapshot_features {
            let mut values = serde_json::Map::new();
            for (k, v) in &fv.values {
                values.insert(k.clone(), json!(v));
            }
            out.insert(fv.instrument.symbol.clone(), Value::Object(values));
        }
        out
    }

    fn build_llm_prompt(&self, context: &ComposeContext) -> String {
        let summary = self.build_summary(context);
        let groups = group_features(&context.features);
        let market_snapshot_features = groups.get("market_snapshot").cloned().unwrap_or_default();
        let market = self.extract_market_section(&market_snapshot_features);

        let positions: Vec<Value> = context
            .portfolio
            .positions
            .iter()
            .filter(|(_, p)| !p.quantity.is_zero())
            .map(|(symbol, p)| {
                json!({
                    "symbol": symbol,
                    "qty": p.quantity.to_string(),
                    "unrealized_pnl": p.unrealized_pnl.map(|v| v.to_string()),
                    "entry_ts": p.entry_ts,
                })
            })
            .collect();

        let constraints = serde_json::to_value(&context.portfolio.constraints).unwrap_or(json!({}));

        let payload = json!({
            "strategy_prompt": self.build_prompt_text(),
            "summary": summary,
            "market": market,
            "features": groups.keys().collect::<Vec<_>>(),
            "positions": positions,
            "constraints": constraints,
        });

        let instructions = "Read Context and decide. features.1m = structural trends (240 periods), \
            features.1s = realtime signals (180 periods). market.funding_rate: positive = longs pay shorts. \
            Respect constraints and risk_flags. Prefer NOOP when edge unclear. Output JSON with items array.";

        format!("{instructions}\n\nContext:\n{}", payload)
    }

    async fn send_plan_notification(&self, result: &ComposeResult) {
        let Some(notifier) = &self.notifier else { return };
        let actionable = result
            .instructions
            .iter()
            .filter(|i| i.action != TradeDecisionAction::Noop)
            .count();
        if actionable == 0 {
            return;
        }
        let strategy_name = &self.request.trading_config.strategy_name;
        let mut message = format!("## Strategy {strategy_name} — Actions Detected\n");
        if let Some(rationale) = &result.rationale {
            message.push_str(&format!("**Overall rationale:**\n{rationale}\n"));
        }
        message.push_str("**Items:**\n");
        for instr in result.instructions.iter().filter(|i| i.action != TradeDecisionAction::Noop) {
            message.push_str(&format!(
                "- **{:?}** `{}` qty={}\n",
                instr.action, instr.instrument.symbol, instr.quantity
            ));
        }
        if let Err(err) = notifier.notify(&message).await {
            tracing::warn!(error = %err, "failed sending plan notification");
        }
    }
}

#[async_trait]
impl Composer for LlmComposer {
    async fn compose(&self, context: &ComposeContext) -> Result<ComposeResult> {
        let prompt = self.build_llm_prompt(context);

        let plan = match self.client.complete(&prompt).await {
            Ok(plan) => plan,
            Err(err) => {
                let message = err.to_string();
                if GatewayError::is_rate_limited(&message) {
                    tracing::warn!(error = %message, "LLM API quota/rate limit exceeded; skipping cycle");
                    return Ok(ComposeResult {
                        instructions: Vec::new(),
                        rationale: Some(
                            "Trading decision skipped: LLM API quota/rate limit exceeded. \
                             Please check your API plan and billing. The strategy will retry in the next cycle."
                                .to_string(),
                        ),
                        rejected: Vec::new(),
                    });
                }
                tracing::error!(error = %message, "LLM invocation failed");
                return Ok(ComposeResult {
                    instructions: Vec::new(),
                    rationale: Some(format!("LLM invocation failed: {message}. Strategy will retry in the next cycle.")),
                    rejected: Vec::new(),
                });
            }
        };

        if plan.items.is_empty() {
            tracing::info!(compose_id = %context.compose_id, rationale = ?plan.rationale, "LLM returned empty plan");
            return Ok(ComposeResult {
                instructions: Vec::new(),
                rationale: plan.rationale,
                rejected: Vec::new(),
            });
        }

        let (instructions, rejected) = guardrails::normalize_plan(&self.request, &self.params, context, &plan);
        let result = ComposeResult {
            instructions,
            rationale: plan.rationale,
            rejected,
        };
        self.send_plan_notification(&result).await;
        Ok(result)
    }
}
