//! Execution gateways: `Paper` (simulated fills) and a
//! venue-backed gateway generalized over per-venue quirks.

pub mod factory;
pub mod paper;
pub mod venue;

pub use factory::create_execution_gateway;
pub use paper::PaperExecutionGateway;
pub use venue::{VenueExecutionGateway, VenueProfile};
