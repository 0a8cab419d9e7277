//! Engine-level supervisor: one `tokio::spawn`-ed task per
//! active strategy, tracked by a `CancellationToken` so shutdown can
//! propagate into in-flight sleeps and exchange calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::types::StopReason;

struct Supervised {
    handle: JoinHandle<StopReason>,
    cancellation: CancellationToken,
}

/// Keyed by `strategy_id`. Strategies are supervised independently: one
/// task panicking or failing never affects another.
pub struct Supervisor {
    strategies: Mutex<HashMap<String, Supervised>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            strategies: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns `run` as a supervised task for `strategy_id`, replacing any
    /// existing task with the same id (the caller is responsible for having
    /// stopped it first).
    pub async fn spawn<F>(&self, strategy_id: String, cancellation: CancellationToken, run: F)
    where
        F: std::future::Future<Output = StopReason> + Send + 'static,
    {
        let handle = tokio::spawn(run);
        self.strategies.lock().await.insert(
            strategy_id,
            Supervised {
                handle,
                cancellation,
            },
        );
    }

    /// Signals cancellation and waits (bounded) for the task to observe it
    /// and terminate cleanly.
    pub async fn stop(&self, strategy_id: &str, grace_period: Duration) -> Option<StopReason> {
        let supervised = self.strategies.lock().await.remove(strategy_id)?;
        supervised.cancellation.cancel();
        match tokio::time::timeout(grace_period, supervised.handle).await {
            Ok(Ok(reason)) => Some(reason),
            Ok(Err(join_err)) => {
                tracing::error!(strategy_id, error = %join_err, "strategy task panicked");
                Some(StopReason::Error)
            }
            Err(_) => {
                tracing::warn!(strategy_id, "strategy task did not stop within grace period");
                None
            }
        }
    }

    pub async fn is_active(&self, strategy_id: &str) -> bool {
        self.strategies.lock().await.contains_key(strategy_id)
    }

    pub async fn active_strategy_ids(&self) -> Vec<String> {
        self.strategies.lock().await.keys().cloned().collect()
    }

    /// Cancels and removes every supervised strategy; used on process
    /// shutdown so nothing outlives the host process.
    pub async fn stop_all(&self, grace_period: Duration) {
        let ids: Vec<String> = self.active_strategy_ids().await;
        for id in ids {
            self.stop(&id, grace_period).await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedSupervisor = Arc<Supervisor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_stop_returns_cancelled() {
        let supervisor = Supervisor::new();
        let token = CancellationToken::new();
        let child = token.clone();
        supervisor
            .spawn("s1".to_string(), token, async move {
                child.cancelled().await;
                StopReason::Cancelled
            })
            .await;
        assert!(supervisor.is_active("s1").await);
        let reason = supervisor.stop("s1", Duration::from_secs(2)).await;
        assert_eq!(reason, Some(StopReason::Cancelled));
        assert!(!supervisor.is_active("s1").await);
    }
}
