//! Borrower feature aggregation
//!
//! The three collaborators are queried concurrently, each under its own
//! timeout. Any failure degrades to a default value; `gather` itself never
//! fails.

use anyhow::{bail, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::stats::OracleStats;
use crate::models::{wei_to_native, FeatureVector, LoanRequest, ValuationSource};
use crate::providers::{AccountInfoProvider, PriceProvider, SocialLinkProvider};

/// Native price used when the live feed is unavailable
pub const DEFAULT_FALLBACK_NATIVE_PRICE: f64 = 200_000.0;

/// Loan valuation tiers, in the reference currency.
///
/// A value strictly above `thresholds[i]` gets `rates_pct[i]`; anything at or
/// below the lowest threshold gets `base_rate_pct`.
#[derive(Debug, Clone, PartialEq)]
pub struct InterestTiers {
    /// high, mid, low
    pub thresholds: [f64; 3],
    /// rates for high, mid, low
    pub rates_pct: [f64; 3],
    pub base_rate_pct: f64,
}

impl Default for InterestTiers {
    fn default() -> Self {
        Self {
            thresholds: [1_000_000.0, 500_000.0, 100_000.0],
            rates_pct: [8.0, 10.0, 11.0],
            base_rate_pct: 12.0,
        }
    }
}

impl InterestTiers {
    pub fn rate_for(&self, value_reference: f64) -> f64 {
        self.thresholds
            .iter()
            .zip(self.rates_pct.iter())
            .find(|(threshold, _)| value_reference > **threshold)
            .map(|(_, rate)| *rate)
            .unwrap_or(self.base_rate_pct)
    }

    /// Thresholds strictly decreasing, rates non-decreasing from the top tier down.
    pub fn validate(&self) -> Result<()> {
        if self.thresholds.iter().any(|t| !t.is_finite() || *t < 0.0) {
            bail!("tier thresholds must be finite and non-negative");
        }
        if !self.thresholds.windows(2).all(|w| w[0] > w[1]) {
            bail!(
                "tier thresholds must be strictly decreasing, got {:?}",
                self.thresholds
            );
        }
        let rates = [
            self.rates_pct[0],
            self.rates_pct[1],
            self.rates_pct[2],
            self.base_rate_pct,
        ];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            bail!("tier rates must be finite and non-negative");
        }
        if !rates.windows(2).all(|w| w[0] <= w[1]) {
            bail!("tier rates must be non-decreasing, got {:?}", rates);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Per-collaborator timeout
    pub provider_timeout: Duration,
    pub fallback_native_price: f64,
    pub tiers: InterestTiers,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(5),
            fallback_native_price: DEFAULT_FALLBACK_NATIVE_PRICE,
            tiers: InterestTiers::default(),
        }
    }
}

pub struct FeatureAggregator {
    account: Arc<dyn AccountInfoProvider>,
    social: Arc<dyn SocialLinkProvider>,
    price: Arc<dyn PriceProvider>,
    config: FeatureConfig,
    stats: Arc<OracleStats>,
}

/// Await `fut` under `limit`. Errors and timeouts are logged and become `None`.
async fn bounded<T, F>(what: &str, limit: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(provider = what, error = %e, "⚠️ Provider call failed, using default");
            None
        }
        Err(_) => {
            warn!(provider = what, timeout_ms = limit.as_millis() as u64, "⚠️ Provider call timed out, using default");
            None
        }
    }
}

impl FeatureAggregator {
    pub fn new(
        account: Arc<dyn AccountInfoProvider>,
        social: Arc<dyn SocialLinkProvider>,
        price: Arc<dyn PriceProvider>,
        config: FeatureConfig,
    ) -> Self {
        Self {
            account,
            social,
            price,
            config,
            stats: Arc::new(OracleStats::default()),
        }
    }

    /// Count provider fallbacks into a shared stats block.
    pub fn with_stats(mut self, stats: Arc<OracleStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub async fn gather(&self, request: &LoanRequest) -> FeatureVector {
        let limit = self.config.provider_timeout;
        let borrower = request.borrower;

        let balance = async {
            match request.test_balance_override {
                Some(wei) => Some(wei),
                None => bounded("balance", limit, self.account.balance(&borrower)).await,
            }
        };
        let tx_count = bounded("transaction_count", limit, self.account.transaction_count(&borrower));
        let days = bounded("days_active", limit, self.account.days_active(&borrower));
        let social = async {
            if request.ens_name.is_empty() {
                Some(Vec::new())
            } else {
                bounded("social", limit, self.social.linked_platforms(&request.ens_name)).await
            }
        };
        let price = bounded("price", limit, async {
            let price = self.price.native_price().await?;
            if !price.is_finite() || price <= 0.0 {
                bail!("unusable native price {}", price);
            }
            Ok::<f64, anyhow::Error>(price)
        });

        let (balance, tx_count, days, social, price) =
            tokio::join!(balance, tx_count, days, social, price);

        let fallbacks = [
            balance.is_none(),
            tx_count.is_none(),
            days.is_none(),
            social.is_none(),
            price.is_none(),
        ]
        .iter()
        .filter(|missing| **missing)
        .count();
        if fallbacks > 0 {
            self.stats
                .provider_fallbacks
                .fetch_add(fallbacks as u64, std::sync::atomic::Ordering::Relaxed);
        }

        let (native_price, valuation_source) = match price {
            Some(p) => (p, ValuationSource::Live),
            None => (self.config.fallback_native_price, ValuationSource::Fallback),
        };
        let loan_value_reference = request.amount_native() * native_price;
        let base_interest_rate_pct = self.config.tiers.rate_for(loan_value_reference);

        let features = FeatureVector {
            balance_native: wei_to_native(balance.unwrap_or(0)),
            transaction_count: tx_count.unwrap_or(0),
            days_active: days.flatten().unwrap_or(0),
            has_social_link: social.map(|p| !p.is_empty()).unwrap_or(false),
            loan_value_reference,
            base_interest_rate_pct,
            valuation_source,
        };

        debug!(
            request_id = %request.request_id,
            balance = features.balance_native,
            tx_count = features.transaction_count,
            social = features.has_social_link,
            loan_value = features.loan_value_reference,
            rate_pct = features.base_interest_rate_pct,
            "gathered features"
        );

        features
    }
}
