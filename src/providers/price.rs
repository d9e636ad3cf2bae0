//! Native asset price feed (CoinGecko `simple/price` compatible)

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;

use super::PriceProvider;

pub const DEFAULT_PRICE_API_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

#[derive(Debug, Clone)]
pub struct PriceFeedConfig {
    pub api_url: String,
    pub coin_id: String,
    /// Reference currency
    pub vs_currency: String,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_PRICE_API_URL.to_string(),
            coin_id: "ethereum".to_string(),
            vs_currency: "inr".to_string(),
        }
    }
}

pub struct CoinGeckoPriceProvider {
    client: Client,
    config: PriceFeedConfig,
}

impl CoinGeckoPriceProvider {
    pub fn new(config: PriceFeedConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }
}

/// Pull `body[coin][currency]` out of a `simple/price` response.
fn extract_price(
    body: &HashMap<String, HashMap<String, f64>>,
    coin_id: &str,
    vs_currency: &str,
) -> Result<f64> {
    let price = body
        .get(coin_id)
        .and_then(|quotes| quotes.get(vs_currency))
        .copied()
        .ok_or_else(|| anyhow!("no {} quote for {} in price response", vs_currency, coin_id))?;

    if !price.is_finite() || price <= 0.0 {
        bail!("price feed returned unusable price {}", price);
    }
    Ok(price)
}

#[async_trait]
impl PriceProvider for CoinGeckoPriceProvider {
    async fn native_price(&self) -> Result<f64> {
        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("ids", self.config.coin_id.as_str()),
                ("vs_currencies", self.config.vs_currency.as_str()),
            ])
            .send()
            .await
            .context("price request failed")?;

        if !response.status().is_success() {
            bail!("price feed returned {}", response.status());
        }

        let body: HashMap<String, HashMap<String, f64>> = response
            .json()
            .await
            .context("failed to parse price response")?;

        extract_price(&body, &self.config.coin_id, &self.config.vs_currency)
    }
}
