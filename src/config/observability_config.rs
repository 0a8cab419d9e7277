//! Logging and metrics tuning. `tracing-subscriber`'s
//! env-filter reads `RUST_LOG`/`LOG_LEVEL` directly; this only adds the
//! knobs that aren't already env-filter syntax (webhook notifier URL,
//! whether to push a `prometheus` registry at all).

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub discord_webhook_url: Option<String>,
    pub metrics_enabled: bool,
}

impl ObservabilityConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            discord_webhook_url: std::env::var("STRATEGY_AGENT_DISCORD_WEBHOOK_URL").ok(),
            metrics_enabled: std::env::var("METRICS_ENABLED").map(|v| v != "0").unwrap_or(true),
        })
    }
}
