//! `sqlx`-backed SQLite persistence. Table layout covers strategies,
//! holdings, portfolio views, compose cycles, instructions, details (closed
//! trades), and prompts, all cascading from `strategies`.
//!
//! Write-through methods swallow and log errors rather than propagating
//! them into the decision loop — a persistence hiccup must never abort a
//! cycle.

use std::str::FromStr;

use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::application::stream_controller::{CyclePersistence, StrategyStatusSource};
use crate::domain::errors::PersistenceError;
use crate::domain::request::UserRequest;
use crate::domain::types::{
    now_ms, DecisionCycleResult, PortfolioView, PositionSnapshot, StopReason, StrategyStatus,
};

pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(database_url).await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategies (
                strategy_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                user_id TEXT,
                status TEXT NOT NULL,
                config TEXT NOT NULL,
                metadata TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategy_holdings (
                strategy_id TEXT NOT NULL REFERENCES strategies(strategy_id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                type TEXT,
                leverage TEXT,
                entry_price TEXT,
                quantity TEXT NOT NULL,
                unrealized_pnl TEXT,
                unrealized_pnl_pct TEXT,
                snapshot_ts INTEGER NOT NULL,
                UNIQUE(strategy_id, symbol, snapshot_ts)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategy_portfolio_views (
                strategy_id TEXT NOT NULL REFERENCES strategies(strategy_id) ON DELETE CASCADE,
                cash TEXT NOT NULL,
                total_value TEXT NOT NULL,
                total_unrealized_pnl TEXT,
                total_realized_pnl TEXT,
                gross_exposure TEXT,
                net_exposure TEXT,
                snapshot_ts INTEGER NOT NULL,
                UNIQUE(strategy_id, snapshot_ts)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategy_compose_cycles (
                strategy_id TEXT NOT NULL REFERENCES strategies(strategy_id) ON DELETE CASCADE,
                compose_id TEXT NOT NULL,
                compose_time INTEGER NOT NULL,
                cycle_index INTEGER NOT NULL,
                rationale TEXT,
                UNIQUE(strategy_id, compose_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategy_instructions (
                strategy_id TEXT NOT NULL REFERENCES strategies(strategy_id) ON DELETE CASCADE,
                compose_id TEXT NOT NULL,
                instruction_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT,
                leverage TEXT,
                note TEXT,
                UNIQUE(strategy_id, instruction_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategy_details (
                strategy_id TEXT NOT NULL REFERENCES strategies(strategy_id) ON DELETE CASCADE,
                compose_id TEXT,
                trade_id TEXT NOT NULL,
                instruction_id TEXT,
                symbol TEXT NOT NULL,
                type TEXT,
                side TEXT,
                leverage TEXT,
                quantity TEXT NOT NULL,
                entry_price TEXT,
                exit_price TEXT,
                avg_exec_price TEXT,
                unrealized_pnl TEXT,
                realized_pnl TEXT,
                realized_pnl_pct TEXT,
                notional_entry TEXT,
                notional_exit TEXT,
                fee_cost TEXT,
                holding_ms INTEGER,
                entry_time INTEGER,
                exit_time INTEGER,
                note TEXT,
                UNIQUE(strategy_id, trade_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategy_prompts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_strategy(&self, strategy_id: &str, request: &UserRequest) -> Result<(), PersistenceError> {
        let config = serde_json::to_string(request).unwrap_or_default();
        let ts = now_ms();
        sqlx::query(
            "INSERT INTO strategies (strategy_id, name, description, user_id, status, config, metadata, created_at, updated_at)
             VALUES (?, ?, NULL, NULL, ?, ?, NULL, ?, ?)",
        )
        .bind(strategy_id)
        .bind(&request.trading_config.strategy_name)
        .bind(status_str(StrategyStatus::Running))
        .bind(config)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_running(&self, strategy_id: &str) -> Result<(), PersistenceError> {
        self.set_status(strategy_id, StrategyStatus::Running).await
    }

    pub async fn mark_stopped(&self, strategy_id: &str) -> Result<(), PersistenceError> {
        self.set_status(strategy_id, StrategyStatus::Stopped).await
    }

    async fn set_status(&self, strategy_id: &str, status: StrategyStatus) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE strategies SET status = ?, updated_at = ? WHERE strategy_id = ?")
            .bind(status_str(status))
            .bind(now_ms())
            .bind(strategy_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Strategy ids whose persisted status is `RUNNING`, for auto-resume at
    /// process startup.
    pub async fn running_strategy_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let rows = sqlx::query("SELECT strategy_id FROM strategies WHERE status = ?")
            .bind(status_str(StrategyStatus::Running))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("strategy_id")).collect())
    }

    pub async fn load_config(&self, strategy_id: &str) -> Result<UserRequest, PersistenceError> {
        let row = sqlx::query("SELECT config FROM strategies WHERE strategy_id = ?")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::StrategyNotFound { strategy_id: strategy_id.to_string() })?;
        let config: String = row.get("config");
        serde_json::from_str(&config).map_err(|_| PersistenceError::StrategyNotFound { strategy_id: strategy_id.to_string() })
    }
}

fn status_str(status: StrategyStatus) -> &'static str {
    match status {
        StrategyStatus::Running => "RUNNING",
        StrategyStatus::Stopped => "STOPPED",
    }
}

fn dec_opt(v: Option<Decimal>) -> Option<String> {
    v.map(|d| d.to_string())
}

fn parse_dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

#[async_trait::async_trait]
impl StrategyStatusSource for SqlitePersistence {
    async fn is_marked_running(&self, strategy_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT status FROM strategies WHERE strategy_id = ?")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("status") == "RUNNING").unwrap_or(false))
    }
}

#[async_trait::async_trait]
impl CyclePersistence for SqlitePersistence {
    async fn has_initial_state(&self, strategy_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM strategy_portfolio_views WHERE strategy_id = ?")
            .bind(strategy_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c") > 0)
    }

    async fn persist_initial_state(&self, strategy_id: &str, portfolio: &PortfolioView) -> Result<()> {
        self.persist_portfolio_snapshot(strategy_id, portfolio).await
    }

    async fn get_latest_portfolio_snapshot(&self, strategy_id: &str) -> Result<Option<PortfolioView>> {
        let row = sqlx::query(
            "SELECT cash, total_value, total_unrealized_pnl, total_realized_pnl, gross_exposure, net_exposure, snapshot_ts
             FROM strategy_portfolio_views WHERE strategy_id = ? ORDER BY snapshot_ts DESC LIMIT 1",
        )
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(PortfolioView {
            strategy_id: Some(strategy_id.to_string()),
            ts_ms: row.get::<i64, _>("snapshot_ts"),
            account_balance: parse_dec(&row.get::<String, _>("cash")),
            positions: std::collections::HashMap::new(),
            gross_exposure: row.get::<Option<String>, _>("gross_exposure").map(|s| parse_dec(&s)).unwrap_or(Decimal::ZERO),
            net_exposure: row.get::<Option<String>, _>("net_exposure").map(|s| parse_dec(&s)).unwrap_or(Decimal::ZERO),
            total_value: parse_dec(&row.get::<String, _>("total_value")),
            total_unrealized_pnl: row.get::<Option<String>, _>("total_unrealized_pnl").map(|s| parse_dec(&s)).unwrap_or(Decimal::ZERO),
            total_realized_pnl: row.get::<Option<String>, _>("total_realized_pnl").map(|s| parse_dec(&s)).unwrap_or(Decimal::ZERO),
            buying_power: Decimal::ZERO,
            free_cash: Decimal::ZERO,
            constraints: Default::default(),
        }))
    }

    /// Persists in the fixed order the concurrency model requires: compose
    /// cycle, instructions, trades, portfolio snapshot, holdings.
    async fn persist_cycle_results(&self, strategy_id: &str, result: &DecisionCycleResult) -> Result<()> {
        if let Err(err) = self.persist_compose_cycle(strategy_id, result).await {
            tracing::error!(strategy_id, error = %err, "failed to persist compose cycle");
        }
        for instr in &result.instructions {
            if let Err(err) = self.persist_instruction(strategy_id, &result.compose_id, instr).await {
                tracing::error!(strategy_id, instruction_id = %instr.instruction_id, error = %err, "failed to persist instruction");
            }
        }
        for trade in &result.trades {
            if let Err(err) = self.persist_trade(strategy_id, trade).await {
                tracing::error!(strategy_id, trade_id = %trade.trade_id, error = %err, "failed to persist trade");
            }
        }
        if let Err(err) = self.persist_portfolio_snapshot(strategy_id, &result.portfolio_view).await {
            tracing::error!(strategy_id, error = %err, "failed to persist portfolio snapshot");
        }
        if let Err(err) = self.persist_holdings(strategy_id, &result.portfolio_view).await {
            tracing::error!(strategy_id, error = %err, "failed to persist holdings");
        }
        Ok(())
    }

    async fn persist_portfolio_snapshot(&self, strategy_id: &str, portfolio: &PortfolioView) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO strategy_portfolio_views
             (strategy_id, cash, total_value, total_unrealized_pnl, total_realized_pnl, gross_exposure, net_exposure, snapshot_ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(strategy_id)
        .bind(portfolio.account_balance.to_string())
        .bind(portfolio.total_value.to_string())
        .bind(portfolio.total_unrealized_pnl.to_string())
        .bind(portfolio.total_realized_pnl.to_string())
        .bind(portfolio.gross_exposure.to_string())
        .bind(portfolio.net_exposure.to_string())
        .bind(portfolio.ts_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize(&self, strategy_id: &str, reason: StopReason) -> Result<()> {
        sqlx::query("UPDATE strategies SET status = ?, metadata = ?, updated_at = ? WHERE strategy_id = ?")
            .bind(status_str(StrategyStatus::Stopped))
            .bind(serde_json::json!({ "stop_reason": reason.to_string() }).to_string())
            .bind(now_ms())
            .bind(strategy_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl SqlitePersistence {
    async fn persist_compose_cycle(&self, strategy_id: &str, result: &DecisionCycleResult) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO strategy_compose_cycles (strategy_id, compose_id, compose_time, cycle_index, rationale)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(strategy_id)
        .bind(&result.compose_id)
        .bind(result.timestamp_ms)
        .bind(result.cycle_index as i64)
        .bind(&result.rationale)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_instruction(
        &self,
        strategy_id: &str,
        compose_id: &str,
        instr: &crate::domain::types::TradeInstruction,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO strategy_instructions
             (strategy_id, compose_id, instruction_id, symbol, action, side, quantity, leverage, note)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(strategy_id)
        .bind(compose_id)
        .bind(&instr.instruction_id)
        .bind(&instr.instrument.symbol)
        .bind(format!("{:?}", instr.action))
        .bind(instr.side.to_string())
        .bind(instr.quantity.to_string())
        .bind(dec_opt(instr.leverage))
        .bind(serde_json::to_string(&instr.meta).ok())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_trade(&self, strategy_id: &str, trade: &crate::domain::types::TradeHistoryEntry) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO strategy_details
             (strategy_id, compose_id, trade_id, instruction_id, symbol, type, side, leverage, quantity,
              entry_price, exit_price, avg_exec_price, unrealized_pnl, realized_pnl, realized_pnl_pct,
              notional_entry, notional_exit, fee_cost, holding_ms, entry_time, exit_time, note)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(strategy_id)
        .bind(&trade.compose_id)
        .bind(&trade.trade_id)
        .bind(&trade.instruction_id)
        .bind(&trade.instrument.symbol)
        .bind(trade.trade_type.map(|t| format!("{t:?}")))
        .bind(trade.side.map(|s| s.to_string()))
        .bind(dec_opt(trade.leverage))
        .bind(trade.quantity.to_string())
        .bind(dec_opt(trade.entry_price))
        .bind(dec_opt(trade.exit_price))
        .bind(dec_opt(trade.avg_exec_price))
        .bind(dec_opt(trade.unrealized_pnl))
        .bind(dec_opt(trade.realized_pnl))
        .bind(dec_opt(trade.realized_pnl_pct))
        .bind(dec_opt(trade.notional_entry))
        .bind(dec_opt(trade.notional_exit))
        .bind(dec_opt(trade.fee_cost))
        .bind(trade.holding_ms)
        .bind(trade.entry_ts)
        .bind(trade.exit_ts)
        .bind(&trade.note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_holdings(&self, strategy_id: &str, portfolio: &PortfolioView) -> Result<()> {
        for position in portfolio.positions.values() {
            if let Err(err) = self.persist_holding(strategy_id, position, portfolio.ts_ms).await {
                tracing::error!(strategy_id, symbol = %position.instrument.symbol, error = %err, "failed to persist holding");
            }
        }
        Ok(())
    }

    async fn persist_holding(&self, strategy_id: &str, position: &PositionSnapshot, snapshot_ts: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO strategy_holdings
             (strategy_id, symbol, type, leverage, entry_price, quantity, unrealized_pnl, unrealized_pnl_pct, snapshot_ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(strategy_id)
        .bind(&position.instrument.symbol)
        .bind(position.trade_type.map(|t| format!("{t:?}")))
        .bind(dec_opt(position.leverage))
        .bind(dec_opt(position.avg_price))
        .bind(position.quantity.to_string())
        .bind(dec_opt(position.unrealized_pnl))
        .bind(dec_opt(position.unrealized_pnl_pct))
        .bind(snapshot_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
