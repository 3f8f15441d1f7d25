//! Batch mark-price source.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

use super::types::TickerPrice;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can price a batch of symbols.
///
/// Missing symbols are simply absent from the map.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn batch_price(&self, symbols: &[String]) -> EngineResult<HashMap<String, Decimal>>;
}

/// Public futures ticker client (read-only).
pub struct PriceFeed {
    client: Client,
    base_url: String,
}

impl PriceFeed {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_tickers(&self) -> Result<Vec<TickerPrice>> {
        let url = format!("{}/fapi/v1/ticker/price", self.base_url);
        debug!(url = %url, "Fetching ticker prices");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch ticker prices")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ticker request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse ticker response")
    }
}

#[async_trait]
impl QuoteSource for PriceFeed {
    async fn batch_price(&self, symbols: &[String]) -> EngineResult<HashMap<String, Decimal>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let tickers = self
            .fetch_tickers()
            .await
            .map_err(|e| EngineError::QuoteUnavailable(format!("{:#}", e)))?;

        let prices: HashMap<String, Decimal> = tickers
            .into_iter()
            .filter(|t| t.price > Decimal::ZERO && symbols.iter().any(|s| s == &t.symbol))
            .map(|t| (t.symbol, t.price))
            .collect();

        if prices.len() < symbols.len() {
            let missing: Vec<&String> = symbols.iter().filter(|s| !prices.contains_key(*s)).collect();
            warn!(missing = ?missing, "Some symbols were not priced");
        }

        Ok(prices)
    }
}
