//! Infrastructure layer: persistence (`sqlx`/SQLite), public market data,
//! and environment/`.env` loading.

pub mod env;
pub mod market_data;
pub mod observability;
pub mod persistence;

pub use env::load_dotenv;
pub use market_data::HttpMarketDataSource;
pub use observability::Metrics;
pub use persistence::SqlitePersistence;
