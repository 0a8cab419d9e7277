//! Application layer: feature pipeline, portfolio accounting, composers,
//! execution gateways, history/digest, the decision coordinator, the
//! per-strategy stream controller, and the engine-wide supervisor.

pub mod composer;
pub mod coordinator;
pub mod execution;
pub mod feature_pipeline;
pub mod history;
pub mod notify;
pub mod portfolio_service;
pub mod runtime;
pub mod stream_controller;
pub mod supervisor;

pub use coordinator::DefaultDecisionCoordinator;
pub use portfolio_service::InMemoryPortfolioService;
pub use runtime::{create_strategy_runtime, StrategyRuntime};
pub use supervisor::{SharedSupervisor, Supervisor};
