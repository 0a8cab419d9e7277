//! Public market-data source: candles and tickers over
//! unauthenticated venue REST endpoints. Kept separate from the execution
//! gateway so strategies can read market data even when running in Virtual
//! mode with no credentials configured.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::ports::MarketDataSource;
use crate::domain::types::{Candle, InstrumentRef, MarketSnapshot};

pub struct HttpMarketDataSource {
    base_url: String,
    http: reqwest_middleware::ClientWithMiddleware,
}

impl HttpMarketDataSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        let retry_policy = reqwest_retry::policies::ExponentialBackoff::builder().build_with_max_retries(2);
        let http = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn candles_url(&self, symbol: &str, interval: &str, lookback: usize) -> String {
        format!(
            "{}/api/v3/klines?symbol={}&interval={interval}&limit={lookback}",
            self.base_url,
            symbol.replace('-', "")
        )
    }

    fn ticker_url(&self) -> String {
        format!("{}/api/v3/ticker/24hr", self.base_url)
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketDataSource {
    async fn get_recent_candles(&self, symbols: &[String], interval: &str, lookback: usize) -> Result<Vec<Candle>> {
        let mut out = Vec::new();
        for symbol in symbols {
            let url = self.candles_url(symbol, interval, lookback);
            let rows: Vec<[serde_json::Value; 6]> = match self.http.get(&url).send().await {
                Ok(resp) => resp.json().await.unwrap_or_default(),
                Err(err) => {
                    tracing::warn!(symbol, interval, error = %err, "candle fetch failed, skipping symbol this cycle");
                    continue;
                }
            };
            for row in rows {
                let parse = |idx: usize| -> Decimal {
                    row[idx]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .or_else(|| row[idx].as_f64().and_then(|f| Decimal::try_from(f).ok()))
                        .unwrap_or(Decimal::ZERO)
                };
                let ts_ms = row[0].as_i64().unwrap_or(0);
                out.push(Candle {
                    ts_ms,
                    instrument: InstrumentRef::new(symbol.clone()),
                    open: parse(1),
                    high: parse(2),
                    low: parse(3),
                    close: parse(4),
                    volume: parse(5),
                    interval: interval.to_string(),
                });
            }
        }
        Ok(out)
    }

    async fn get_market_snapshot(&self, symbols: &[String]) -> Result<HashMap<String, MarketSnapshot>> {
        let url = self.ticker_url();
        let tickers: Vec<serde_json::Value> = self
            .http
            .get(&url)
            .send()
            .await
            .context("fetching 24hr ticker snapshot")?
            .json()
            .await
            .context("decoding ticker snapshot response")?;

        let mut by_symbol: HashMap<String, serde_json::Value> = tickers
            .into_iter()
            .filter_map(|v| v.get("symbol").and_then(|s| s.as_str()).map(|s| (s.to_string(), v.clone())))
            .collect();

        let mut out = HashMap::new();
        for symbol in symbols {
            let venue_symbol = symbol.replace('-', "");
            if let Some(ticker) = by_symbol.remove(&venue_symbol) {
                let mut snapshot = MarketSnapshot::default();
                for (field, key) in [
                    ("last", "lastPrice"),
                    ("open", "openPrice"),
                    ("high", "highPrice"),
                    ("low", "lowPrice"),
                    ("bid", "bidPrice"),
                    ("ask", "askPrice"),
                    ("volume", "volume"),
                ] {
                    if let Some(v) = ticker.get(key).and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok()) {
                        snapshot.price.insert(field.to_string(), v);
                    }
                }
                if let Some(change) = ticker.get("priceChangePercent").and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok()) {
                    snapshot.price.insert("change_pct".to_string(), change / 100.0);
                }
                // Venues that don't populate the unified fields above still
                // carry their native field names somewhere in the raw
                // ticker payload (or under a nested `info` object, ccxt-
                // style); capture both so the feature pipeline can fall back.
                if let Some(raw_info) = ticker.get("info").and_then(|v| v.as_object()).or_else(|| ticker.as_object()) {
                    for (key, value) in raw_info {
                        if let Some(f) = value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok())) {
                            snapshot.info.insert(key.clone(), f);
                        }
                    }
                }
                out.insert(symbol.clone(), snapshot);
            }
        }
        Ok(out)
    }
}
