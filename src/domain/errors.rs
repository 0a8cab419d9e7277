//! Domain error taxonomy. Business rejections are
//! *not* modeled here: they flow through as typed `TxStatus::Rejected`
//! values, never as `Err`. These enums cover the remaining behavioral
//! categories: fatal init errors, transient venue errors, and persistence
//! failures that the caller chooses whether to swallow.

use thiserror::Error;

/// Errors that abort strategy *creation*, before any cycle runs.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("missing credentials for LIVE gateway on venue {venue}")]
    MissingCredentials { venue: String },

    #[error("unknown execution venue: {venue}")]
    UnknownVenue { venue: String },

    #[error("LIVE trading mode has initial_capital={initial_capital}; balance fetch likely failed")]
    NoInitialCapital { initial_capital: f64 },
}

/// Errors surfaced by an execution gateway that are not business rejections:
/// connectivity, auth, or malformed-response problems. The coordinator
/// catches these and defers retry to the next cycle; they never propagate
/// out of `run_once`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("venue request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("venue rate limit or quota exceeded: {reason}")]
    RateLimited { reason: String },

    #[error("order submission failed for {symbol}: {reason}")]
    OrderFailed { symbol: String, reason: String },

    #[error("timeout after {duration_ms}ms talking to venue")]
    Timeout { duration_ms: u64 },
}

impl GatewayError {
    /// Rate-limit/quota detection is substring based, matching the venue
    /// error strings the reference composer already special-cases.
    pub fn is_rate_limited(message: &str) -> bool {
        let lower = message.to_lowercase();
        message.contains("429") || message.contains("RESOURCE_EXHAUSTED") || lower.contains("quota")
    }
}

/// Errors from the persistence layer. Always logged and swallowed by
/// callers in the decision loop; kept as a typed error so
/// call sites can still `match` on cause for logging detail.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("strategy {strategy_id} not found")]
    StrategyNotFound { strategy_id: String },
}

/// Errors from the composer (LLM or rule-based). A composer failure never
/// aborts the cycle: callers convert it into an empty `ComposeResult` with an
/// explanatory rationale.
#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("LLM invocation failed: {0}")]
    LlmInvocation(String),

    #[error("LLM output failed validation: {raw}")]
    InvalidOutput { raw: String },
}
