//! External borrower signal providers
//!
//! Every provider is allowed to fail. The feature aggregator bounds each call
//! with a timeout and substitutes defaults, so implementations just return
//! errors and never retry on their own.

pub mod account;
pub mod price;
pub mod social;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Address;

pub use price::{CoinGeckoPriceProvider, PriceFeedConfig};
pub use social::{HttpSocialProvider, NoSocialProvider};

/// On-chain account activity
#[async_trait]
pub trait AccountInfoProvider: Send + Sync {
    /// Balance in wei
    async fn balance(&self, account: &Address) -> Result<u128>;

    async fn transaction_count(&self, account: &Address) -> Result<u64>;

    /// Account age in days, when the provider knows it
    async fn days_active(&self, _account: &Address) -> Result<Option<u32>> {
        Ok(None)
    }
}

/// Identity platforms linked to a declared name
#[async_trait]
pub trait SocialLinkProvider: Send + Sync {
    async fn linked_platforms(&self, name: &str) -> Result<Vec<String>>;
}

/// Native asset price in the reference currency
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn native_price(&self) -> Result<f64>;
}
