//! Account info straight from the ledger node

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::AccountInfoProvider;
use crate::chain::RpcClient;
use crate::models::Address;

#[async_trait]
impl AccountInfoProvider for RpcClient {
    async fn balance(&self, account: &Address) -> Result<u128> {
        self.get_balance(account)
            .await
            .map_err(|e| anyhow!("eth_getBalance({}) failed: {}", account, e))
    }

    async fn transaction_count(&self, account: &Address) -> Result<u64> {
        self.get_transaction_count(account, "latest")
            .await
            .map_err(|e| anyhow!("eth_getTransactionCount({}) failed: {}", account, e))
    }
}
