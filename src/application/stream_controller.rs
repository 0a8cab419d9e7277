//! Per-strategy state machine and run loop.
//! `INITIALIZING → WAITING_RUNNING → RUNNING → STOPPED`. Decouples strategy
//! construction from actual start: the controller polls persistence for the
//! `RUNNING` flip (set by an outer API layer) before entering its loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::application::coordinator::DefaultDecisionCoordinator;
use crate::domain::ports::{ExecutionGateway, MetricsSink};
use crate::domain::types::{DecisionCycleResult, PortfolioView, StopReason};

const WAIT_RUNNING_TIMEOUT_SECS: u64 = 300;
const WAIT_RUNNING_POLL_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    WaitingRunning,
    Running,
    Stopped,
}

/// Checks whether persistence reports a strategy as actively running; a
/// thin seam so the controller doesn't depend on the persistence crate
/// directly.
#[async_trait::async_trait]
pub trait StrategyStatusSource: Send + Sync {
    async fn is_marked_running(&self, strategy_id: &str) -> Result<bool>;
}

/// Receives cycle results, trades, and final status for write-through.
#[async_trait::async_trait]
pub trait CyclePersistence: Send + Sync {
    async fn has_initial_state(&self, strategy_id: &str) -> Result<bool>;
    async fn persist_initial_state(&self, strategy_id: &str, portfolio: &PortfolioView) -> Result<()>;
    async fn get_latest_portfolio_snapshot(&self, strategy_id: &str) -> Result<Option<PortfolioView>>;
    async fn persist_cycle_results(&self, strategy_id: &str, result: &DecisionCycleResult) -> Result<()>;
    async fn persist_portfolio_snapshot(&self, strategy_id: &str, portfolio: &PortfolioView) -> Result<()>;
    async fn finalize(&self, strategy_id: &str, reason: StopReason) -> Result<()>;
}

pub struct StreamController<P: CyclePersistence, S: StrategyStatusSource> {
    strategy_id: String,
    coordinator: DefaultDecisionCoordinator,
    gateway: Arc<dyn ExecutionGateway>,
    persistence: Arc<P>,
    status_source: Arc<S>,
    decide_interval: Duration,
    cancellation: CancellationToken,
    state: ControllerState,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl<P: CyclePersistence, S: StrategyStatusSource> StreamController<P, S> {
    pub fn new(
        strategy_id: String,
        coordinator: DefaultDecisionCoordinator,
        gateway: Arc<dyn ExecutionGateway>,
        persistence: Arc<P>,
        status_source: Arc<S>,
        decide_interval: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            strategy_id,
            coordinator,
            gateway,
            persistence,
            status_source,
            decide_interval,
            cancellation,
            state: ControllerState::Initializing,
            metrics: None,
        }
    }

    /// Attaches a metrics sink; cycles run before this is called simply skip
    /// recording.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Polls every second for up to `timeout` waiting for persistence to
    /// report `RUNNING`. On timeout, proceeds anyway (degrades to immediate
    /// RUNNING) — never blocks strategy start indefinitely.
    pub async fn wait_running(&mut self) {
        self.state = ControllerState::WaitingRunning;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(WAIT_RUNNING_TIMEOUT_SECS);
        loop {
            if self.cancellation.is_cancelled() {
                return;
            }
            match self.status_source.is_marked_running(&self.strategy_id).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => tracing::warn!(error = %err, strategy_id = %self.strategy_id, "status poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(strategy_id = %self.strategy_id, "wait_running timed out, proceeding anyway");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(WAIT_RUNNING_POLL_SECS)) => {}
                _ = self.cancellation.cancelled() => return,
            }
        }
        self.state = ControllerState::Running;
    }

    /// Idempotent: writes the initial portfolio snapshot only if none exists
    /// yet for this strategy.
    pub async fn persist_initial_state_if_absent(&self, portfolio: &PortfolioView) -> Result<()> {
        if !self.persistence.has_initial_state(&self.strategy_id).await? {
            self.persistence.persist_initial_state(&self.strategy_id, portfolio).await?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == ControllerState::Running
    }

    /// Main loop: while persistence reports this strategy running, runs a
    /// cycle, persists it, sleeps (cancellably), repeat. On exit, performs
    /// the termination sequence.
    pub async fn run(&mut self) -> StopReason {
        let stop_reason = loop {
            match self.status_source.is_marked_running(&self.strategy_id).await {
                Ok(false) => break StopReason::NormalExit,
                Err(err) => {
                    tracing::error!(error = %err, strategy_id = %self.strategy_id, "status check failed");
                    break StopReason::Error;
                }
                Ok(true) => {}
            }

            let result = match self.coordinator.run_once().await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(error = %err, strategy_id = %self.strategy_id, "cycle failed");
                    break StopReason::Error;
                }
            };

            if let Err(err) = self.persistence.persist_cycle_results(&self.strategy_id, &result).await {
                tracing::error!(error = %err, strategy_id = %self.strategy_id, "failed to persist cycle result");
            }

            if let Some(metrics) = &self.metrics {
                let view = &result.portfolio_view;
                metrics.record_cycle(
                    &self.strategy_id,
                    &result.instructions,
                    view.total_value.to_string().parse().unwrap_or(0.0),
                    view.free_cash.to_string().parse().unwrap_or(0.0),
                    view.positions.len(),
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.decide_interval) => {}
                _ = self.cancellation.cancelled() => break StopReason::Cancelled,
            }
        };

        self.terminate(stop_reason).await
    }

    async fn terminate(&mut self, mut stop_reason: StopReason) -> StopReason {
        if stop_reason == StopReason::NormalExit {
            if let Err(err) = self.coordinator.close_all_positions().await {
                tracing::error!(error = %err, strategy_id = %self.strategy_id, "close_all_positions failed");
                stop_reason = StopReason::ErrorClosingPositions;
            }
        }

        if let Err(err) = self.gateway.close().await {
            tracing::warn!(error = %err, strategy_id = %self.strategy_id, "gateway close failed");
        }

        let final_view = self.coordinator.portfolio_view();
        if let Err(err) = self.persistence.persist_portfolio_snapshot(&self.strategy_id, &final_view).await {
            tracing::error!(error = %err, strategy_id = %self.strategy_id, "final snapshot persist failed");
        }

        if let Err(err) = self.persistence.finalize(&self.strategy_id, stop_reason).await {
            tracing::error!(error = %err, strategy_id = %self.strategy_id, "finalize failed");
        }

        self.state = ControllerState::Stopped;
        stop_reason
    }
}
