use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use strategy_engine::application::composer::{GridComposer, LlmComposer};
use strategy_engine::application::execution::create_execution_gateway;
use strategy_engine::application::notify::WebhookNotifier;
use strategy_engine::application::stream_controller::StreamController;
use strategy_engine::application::{create_strategy_runtime, Supervisor};
use strategy_engine::config::EngineConfig;
use strategy_engine::domain::ports::{Composer, LlmClient, MetricsSink, Notifier};
use strategy_engine::domain::request::UserRequest;
use strategy_engine::domain::types::TradePlanProposal;
use strategy_engine::infrastructure::{load_dotenv, HttpMarketDataSource, Metrics, SqlitePersistence};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// LLM provider wiring is out of scope for this engine (see ambient-stack
/// notes); any strategy configured with an LLM provider gets this stub,
/// which always reports failure so the composer falls back to an empty
/// plan with an explanatory rationale rather than silently trading blind.
struct UnimplementedLlmClient;

#[async_trait]
impl LlmClient for UnimplementedLlmClient {
    async fn complete(&self, _prompt: &str) -> Result<TradePlanProposal> {
        anyhow::bail!("no LLM provider adapter is wired into this build")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let config = EngineConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.observability.log_level.clone()))
        .init();

    let persistence = Arc::new(SqlitePersistence::connect(&config.persistence.database_url).await?);
    let market_data = Arc::new(HttpMarketDataSource::new("https://api.binance.com"));
    let notifier = Arc::new(WebhookNotifier::new(config.observability.discord_webhook_url.clone()));
    let supervisor = Arc::new(Supervisor::new());
    let metrics: Option<Arc<dyn MetricsSink>> = if config.observability.metrics_enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    let request = UserRequest {
        exchange_config: config.broker.clone().into_exchange_config(),
        trading_config: config.strategy.trading.clone(),
        llm_model_config: config.strategy.llm.clone(),
    };

    for strategy_id in persistence.running_strategy_ids().await.unwrap_or_default() {
        tracing::info!(strategy_id = %strategy_id, "auto-resuming strategy from persisted RUNNING status");
        if let Ok(resumed_request) = persistence.load_config(&strategy_id).await {
            spawn_strategy(
                strategy_id,
                resumed_request,
                market_data.clone(),
                persistence.clone(),
                notifier.clone(),
                metrics.clone(),
                supervisor.clone(),
            )
            .await;
        }
    }

    let strategy_id = format!("strategy-{}", Uuid::new_v4());
    persistence.create_strategy(&strategy_id, &request).await?;
    spawn_strategy(strategy_id, request, market_data, persistence, notifier, metrics, supervisor.clone()).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping all strategies");
    supervisor.stop_all(Duration::from_secs(30)).await;
    Ok(())
}

async fn spawn_strategy(
    strategy_id: String,
    request: UserRequest,
    market_data: Arc<HttpMarketDataSource>,
    persistence: Arc<SqlitePersistence>,
    notifier: Arc<WebhookNotifier>,
    metrics: Option<Arc<dyn MetricsSink>>,
    supervisor: Arc<Supervisor>,
) {
    let gateway = match create_execution_gateway(&request.exchange_config) {
        Ok(gw) => gw,
        Err(err) => {
            tracing::error!(strategy_id = %strategy_id, error = %err, "failed to create execution gateway, skipping strategy");
            return;
        }
    };

    let composer: Arc<dyn Composer> = if request.llm_model_config.is_some() {
        let notifier: Arc<dyn Notifier> = notifier.clone();
        Arc::new(LlmComposer::new(request.clone(), Arc::new(UnimplementedLlmClient), Some(notifier)))
    } else {
        Arc::new(GridComposer::new(request.clone()))
    };

    let decide_interval = Duration::from_secs(request.trading_config.decide_interval_secs);

    let runtime = match create_strategy_runtime(strategy_id.clone(), request, market_data, gateway, composer).await {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(strategy_id = %strategy_id, error = %err, "failed to construct strategy runtime, skipping strategy");
            return;
        }
    };

    let cancellation = CancellationToken::new();
    let span = tracing::info_span!("strategy", strategy_id = %strategy_id);

    let mut controller = StreamController::new(
        strategy_id.clone(),
        runtime.coordinator,
        runtime.gateway,
        persistence.clone(),
        persistence,
        decide_interval,
        cancellation.clone(),
    );
    if let Some(metrics) = metrics {
        controller = controller.with_metrics(metrics);
    }

    supervisor
        .spawn(strategy_id, cancellation, async move {
            use tracing::Instrument;
            async move {
                controller.wait_running().await;
                controller.run().await
            }
            .instrument(span)
            .await
        })
        .await;
}
