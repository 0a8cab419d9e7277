//! Strategy decision-execution engine: turns market data and portfolio
//! state into guardrail-normalized trade instructions, executes them
//! against a paper or venue-backed gateway, and persists the resulting
//! cycle history per strategy.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
