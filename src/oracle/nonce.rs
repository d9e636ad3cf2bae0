//! Nonce allocation for the oracle account
//!
//! The counter lives behind an async mutex that is held across the chain read,
//! so concurrent first callers cannot both seed from the same pending count.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chain::LedgerClient;
use crate::models::Address;

pub struct NonceSequencer {
    client: Arc<dyn LedgerClient>,
    account: Address,
    /// Next nonce to hand out. `None` until seeded or after a resync.
    next: Mutex<Option<u64>>,
    rpc_timeout: Duration,
}

impl NonceSequencer {
    pub fn new(client: Arc<dyn LedgerClient>, account: Address, rpc_timeout: Duration) -> Self {
        Self {
            client,
            account,
            next: Mutex::new(None),
            rpc_timeout,
        }
    }

    pub fn account(&self) -> &Address {
        &self.account
    }

    /// Reserve the next nonce. Seeds from the node's pending count when needed.
    pub async fn next(&self) -> Result<u64> {
        let mut guard = self.next.lock().await;
        let nonce = match *guard {
            Some(n) => n,
            None => {
                let seeded = tokio::time::timeout(self.rpc_timeout, self.client.pending_nonce(&self.account))
                    .await
                    .map_err(|_| anyhow!("timed out reading pending nonce"))?
                    .map_err(|e| anyhow!("failed to read pending nonce: {}", e))?;
                info!(account = %self.account, nonce = seeded, "🔢 Nonce sequencer seeded from chain");
                seeded
            }
        };
        *guard = Some(nonce + 1);
        debug!(nonce, "reserved nonce");
        Ok(nonce)
    }

    /// Forget the local counter; the next reservation re-reads the chain.
    pub async fn resync(&self) {
        let mut guard = self.next.lock().await;
        if guard.take().is_some() {
            info!(account = %self.account, "🔄 Nonce sequencer will resync from chain");
        }
    }

    /// Next nonce that would be handed out, if seeded
    pub async fn peek(&self) -> Option<u64> {
        *self.next.lock().await
    }
}
