//! Push-based observability: no metrics HTTP server of its own, just a
//! `prometheus::Registry` a host process can scrape or forward.

pub mod metrics;

pub use metrics::Metrics;
