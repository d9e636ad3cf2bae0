//! Fulfillment transaction submission
//!
//! Sends go through a single lane so that nonces reach the node in order.
//! Retry rules per attempt:
//! - node rejected the transaction: it was not accepted, retry with the same nonce
//! - node says the nonce is too low: resync the sequencer, retry with a fresh nonce
//! - transport failure or timeout: ambiguous. If the node knows our locally
//!   computed hash the attempt counts as accepted, otherwise resync and retry.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::nonce::NonceSequencer;
use super::stats::OracleStats;
use crate::chain::abi::encode_fulfill;
use crate::chain::{LedgerClient, LegacyTransaction, RpcError, TransactionSigner};
use crate::models::{Address, Decision, RequestId, SubmissionOutcome, SubmissionRecord, TxHash};

pub const DEFAULT_GAS_LIMIT: u64 = 2_000_000;

#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub gas_limit: u64,
    /// Bound on every individual node call
    pub rpc_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            gas_limit: DEFAULT_GAS_LIMIT,
            rpc_timeout: Duration::from_secs(10),
            confirmation_timeout: Duration::from_secs(120),
            receipt_poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct SubmissionManager {
    client: Arc<dyn LedgerClient>,
    signer: Arc<dyn TransactionSigner>,
    nonces: Arc<NonceSequencer>,
    contract: Address,
    chain_id: u64,
    config: SubmissionConfig,
    lane: Mutex<()>,
    stats: Arc<OracleStats>,
}

/// Up to 25% extra on top of `base`
fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64) / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

async fn bounded_rpc<T, F>(limit: Duration, fut: F) -> Result<T, RpcError>
where
    F: std::future::Future<Output = Result<T, RpcError>>,
{
    timeout(limit, fut).await.unwrap_or(Err(RpcError::Timeout))
}

impl SubmissionManager {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        signer: Arc<dyn TransactionSigner>,
        nonces: Arc<NonceSequencer>,
        contract: Address,
        chain_id: u64,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            client,
            signer,
            nonces,
            contract,
            chain_id,
            config,
            lane: Mutex::new(()),
            stats: Arc::new(OracleStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<OracleStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &SubmissionConfig {
        &self.config
    }

    /// Sign and send the fulfillment for `request_id`.
    ///
    /// Returns `Pending` once the node accepted a transaction, or
    /// `SubmissionError` when every attempt failed.
    pub async fn submit(&self, request_id: &RequestId, decision: &Decision) -> SubmissionRecord {
        let _lane = self.lane.lock().await;

        let data = encode_fulfill(request_id, decision);
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        // Reserved nonce not yet known to be consumed
        let mut reserved: Option<u64> = None;
        let mut last_nonce = 0;
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                OracleStats::incr(&self.stats.submission_retries);
                sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }

            // Gas price first so a failing node does not burn a nonce reservation
            let gas_price = match bounded_rpc(self.config.rpc_timeout, self.client.gas_price()).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(request_id = %request_id, attempt, error = %e, "⚠️ Gas price unavailable");
                    last_error = Some(format!("gas price: {}", e));
                    continue;
                }
            };

            let nonce = match reserved {
                Some(n) => n,
                None => match self.nonces.next().await {
                    Ok(n) => {
                        reserved = Some(n);
                        n
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, attempt, error = %e, "⚠️ Nonce unavailable");
                        last_error = Some(e.to_string());
                        continue;
                    }
                },
            };
            last_nonce = nonce;

            let tx = LegacyTransaction {
                nonce,
                gas_price,
                gas_limit: self.config.gas_limit,
                to: self.contract,
                value: 0,
                data: data.clone(),
                chain_id: self.chain_id,
            };
            let signed = match self.signer.sign(&tx) {
                Ok(signed) => signed,
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "❌ Failed to sign fulfillment");
                    last_error = Some(format!("signing: {}", e));
                    continue;
                }
            };

            debug!(request_id = %request_id, attempt, nonce, tx_hash = %signed.hash, "sending fulfillment");

            let sent = bounded_rpc(
                self.config.rpc_timeout,
                self.client.send_raw_transaction(&signed.raw),
            )
            .await;

            let accepted = match sent {
                Ok(hash) => Some(hash),
                Err(e) if e.is_already_known() => Some(signed.hash),
                Err(e) if e.is_nonce_too_low() => {
                    warn!(request_id = %request_id, attempt, nonce, error = %e, "⚠️ Nonce already used, resyncing");
                    self.nonces.resync().await;
                    reserved = None;
                    last_error = Some(e.to_string());
                    None
                }
                Err(e) if e.is_ambiguous() => {
                    warn!(request_id = %request_id, attempt, nonce, error = %e, "⚠️ Send outcome unknown, checking node");
                    last_error = Some(e.to_string());
                    let known = bounded_rpc(
                        self.config.rpc_timeout,
                        self.client.is_transaction_known(&signed.hash),
                    )
                    .await;
                    match known {
                        Ok(true) => Some(signed.hash),
                        _ => {
                            self.nonces.resync().await;
                            reserved = None;
                            None
                        }
                    }
                }
                Err(e) => {
                    warn!(request_id = %request_id, attempt, nonce, error = %e, "⚠️ Node rejected fulfillment");
                    last_error = Some(e.to_string());
                    None
                }
            };

            if let Some(hash) = accepted {
                info!(request_id = %request_id, attempt, nonce, tx_hash = %hash, "📤 Fulfillment submitted");
                return self.record(request_id, nonce, attempt, Some(hash), SubmissionOutcome::Pending, None);
            }
        }

        // A reserved nonce that never reached the node would leave a gap
        if reserved.is_some() {
            self.nonces.resync().await;
        }
        error!(
            request_id = %request_id,
            attempts = max_attempts,
            error = last_error.as_deref().unwrap_or("unknown"),
            "❌ Fulfillment submission exhausted"
        );
        self.record(
            request_id,
            last_nonce,
            max_attempts,
            None,
            SubmissionOutcome::SubmissionError,
            last_error,
        )
    }

    fn record(
        &self,
        request_id: &RequestId,
        nonce: u64,
        attempt: u32,
        transaction_hash: Option<TxHash>,
        outcome: SubmissionOutcome,
        last_error: Option<String>,
    ) -> SubmissionRecord {
        SubmissionRecord {
            request_id: *request_id,
            nonce,
            attempt,
            transaction_hash,
            outcome,
            submitted_at: Utc::now(),
            last_error,
        }
    }

    /// Poll for the receipt of `record` until it is mined or the
    /// confirmation timeout passes (`Pending`). A timeout also resyncs the
    /// nonce sequencer from the node's pending count.
    pub async fn await_confirmation(&self, record: &SubmissionRecord) -> SubmissionOutcome {
        let Some(hash) = record.transaction_hash else {
            return SubmissionOutcome::SubmissionError;
        };

        let deadline = Instant::now() + self.config.confirmation_timeout;
        loop {
            match bounded_rpc(self.config.rpc_timeout, self.client.transaction_receipt(&hash)).await {
                Ok(Some(receipt)) if receipt.success => {
                    info!(request_id = %record.request_id, tx_hash = %hash, block = ?receipt.block_number, "✅ Fulfillment confirmed");
                    return SubmissionOutcome::Confirmed;
                }
                Ok(Some(receipt)) => {
                    error!(request_id = %record.request_id, tx_hash = %hash, block = ?receipt.block_number, "❌ Fulfillment reverted");
                    return SubmissionOutcome::Reverted;
                }
                Ok(None) => {}
                Err(e) => debug!(tx_hash = %hash, error = %e, "receipt lookup failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    request_id = %record.request_id,
                    tx_hash = %hash,
                    timeout_secs = self.config.confirmation_timeout.as_secs(),
                    "⚠️ No receipt before confirmation timeout"
                );
                // The node may have dropped it; later nonces must not leave a gap
                self.nonces.resync().await;
                return SubmissionOutcome::Pending;
            }
            sleep(self.config.receipt_poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{LocalKeySigner, TransactionReceipt};
    use crate::models::{ScoreResult, ScoreSource};
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedNode {
        pending: AtomicU64,
        nonce_reads: AtomicUsize,
        sends: SyncMutex<VecDeque<Result<TxHash, RpcError>>>,
        sent: SyncMutex<Vec<Vec<u8>>>,
        known: SyncMutex<bool>,
        receipts: SyncMutex<VecDeque<Option<TransactionReceipt>>>,
    }

    #[async_trait::async_trait]
    impl LedgerClient for ScriptedNode {
        async fn pending_nonce(&self, _account: &Address) -> Result<u64, RpcError> {
            self.nonce_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.pending.load(Ordering::SeqCst))
        }

        async fn gas_price(&self) -> Result<u128, RpcError> {
            Ok(1_000_000_000)
        }

        async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, RpcError> {
            self.sent.lock().push(raw.to_vec());
            self.sends
                .lock()
                .pop_front()
                .unwrap_or(Ok(TxHash([0xee; 32])))
        }

        async fn transaction_receipt(&self, _hash: &TxHash) -> Result<Option<TransactionReceipt>, RpcError> {
            Ok(self.receipts.lock().pop_front().flatten())
        }

        async fn is_transaction_known(&self, _hash: &TxHash) -> Result<bool, RpcError> {
            Ok(*self.known.lock())
        }
    }

    fn rejected(message: &str) -> RpcError {
        RpcError::Node {
            code: -32000,
            message: message.to_string(),
        }
    }

    fn decision() -> Decision {
        Decision {
            score: ScoreResult {
                value: 700,
                source: ScoreSource::RuleBased,
            },
            approved: true,
            interest_rate_bps: 1100,
        }
    }

    fn manager(node: Arc<ScriptedNode>) -> (SubmissionManager, Arc<NonceSequencer>) {
        let signer = Arc::new(LocalKeySigner::from_hex(&"46".repeat(32)).unwrap());
        let nonces = Arc::new(NonceSequencer::new(
            node.clone(),
            signer.address(),
            Duration::from_secs(1),
        ));
        let config = SubmissionConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            confirmation_timeout: Duration::from_millis(50),
            receipt_poll_interval: Duration::from_millis(5),
            ..SubmissionConfig::default()
        };
        let mgr = SubmissionManager::new(node, signer, nonces.clone(), Address([9; 20]), 1337, config);
        (mgr, nonces)
    }

    #[tokio::test]
    async fn test_first_attempt_accepted() {
        let node = Arc::new(ScriptedNode::default());
        node.pending.store(4, Ordering::SeqCst);
        let (mgr, nonces) = manager(node.clone());

        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;
        assert_eq!(record.outcome, SubmissionOutcome::Pending);
        assert_eq!(record.nonce, 4);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.transaction_hash, Some(TxHash([0xee; 32])));
        assert_eq!(nonces.peek().await, Some(5));
    }

    #[tokio::test]
    async fn test_definitive_rejection_reuses_nonce() {
        let node = Arc::new(ScriptedNode::default());
        node.sends.lock().push_back(Err(rejected("insufficient funds for gas")));
        let (mgr, nonces) = manager(node.clone());

        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;
        assert_eq!(record.outcome, SubmissionOutcome::Pending);
        assert_eq!(record.attempt, 2);
        assert_eq!(record.nonce, 0);
        assert_eq!(nonces.peek().await, Some(1));
        assert_eq!(node.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_nonce_too_low_resyncs() {
        let node = Arc::new(ScriptedNode::default());
        node.sends.lock().push_back(Err(rejected("nonce too low")));
        let (mgr, _) = manager(node.clone());

        // another process used nonces 0..12 meanwhile
        node.pending.store(0, Ordering::SeqCst);
        let first = mgr.nonces.next().await.unwrap();
        assert_eq!(first, 0);
        node.pending.store(12, Ordering::SeqCst);

        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;
        assert_eq!(record.outcome, SubmissionOutcome::Pending);
        assert_eq!(record.nonce, 12);
        assert_eq!(node.nonce_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ambiguous_send_known_to_node_is_accepted() {
        let node = Arc::new(ScriptedNode::default());
        node.sends.lock().push_back(Err(RpcError::Timeout));
        *node.known.lock() = true;
        let (mgr, _) = manager(node.clone());

        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;
        assert_eq!(record.outcome, SubmissionOutcome::Pending);
        assert_eq!(record.attempt, 1);
        assert_eq!(node.sent.lock().len(), 1);

        let expected = TxHash(crate::chain::abi::keccak256(&node.sent.lock()[0]));
        assert_eq!(record.transaction_hash, Some(expected));
    }

    #[tokio::test]
    async fn test_ambiguous_send_unknown_to_node_resyncs() {
        let node = Arc::new(ScriptedNode::default());
        node.sends
            .lock()
            .push_back(Err(RpcError::Transport("connection reset".into())));
        let (mgr, _) = manager(node.clone());

        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;
        assert_eq!(record.outcome, SubmissionOutcome::Pending);
        assert_eq!(record.attempt, 2);
        assert_eq!(node.nonce_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_submission_error() {
        let node = Arc::new(ScriptedNode::default());
        for _ in 0..3 {
            node.sends.lock().push_back(Err(rejected("gas price too low")));
        }
        let (mgr, nonces) = manager(node.clone());

        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;
        assert_eq!(record.outcome, SubmissionOutcome::SubmissionError);
        assert_eq!(record.attempt, 3);
        assert!(record.transaction_hash.is_none());
        assert!(record.last_error.unwrap().contains("gas price too low"));
        // the unused reservation is released
        assert_eq!(nonces.peek().await, None);
        assert_eq!(mgr.stats.snapshot().submission_retries, 2);
    }

    #[tokio::test]
    async fn test_confirmation_outcomes() {
        let node = Arc::new(ScriptedNode::default());
        let (mgr, _) = manager(node.clone());
        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;

        node.receipts.lock().extend([
            None,
            Some(TransactionReceipt {
                success: true,
                block_number: Some(10),
            }),
        ]);
        assert_eq!(mgr.await_confirmation(&record).await, SubmissionOutcome::Confirmed);

        node.receipts.lock().push_back(Some(TransactionReceipt {
            success: false,
            block_number: Some(11),
        }));
        assert_eq!(mgr.await_confirmation(&record).await, SubmissionOutcome::Reverted);

        // nothing scripted: never mined
        assert_eq!(mgr.await_confirmation(&record).await, SubmissionOutcome::Pending);
    }

    #[tokio::test]
    async fn test_unconfirmed_transaction_resyncs_nonces() {
        let node = Arc::new(ScriptedNode::default());
        node.pending.store(3, Ordering::SeqCst);
        let (mgr, nonces) = manager(node.clone());

        let record = mgr.submit(&RequestId([1; 32]), &decision()).await;
        assert_eq!(record.nonce, 3);
        assert_eq!(nonces.peek().await, Some(4));

        // dropped by the node: pending count never moved past 3
        assert_eq!(mgr.await_confirmation(&record).await, SubmissionOutcome::Pending);
        assert_eq!(nonces.peek().await, None);

        let next = mgr.submit(&RequestId([2; 32]), &decision()).await;
        assert_eq!(next.nonce, 3);
    }

    #[tokio::test]
    async fn test_confirmation_without_hash() {
        let node = Arc::new(ScriptedNode::default());
        let (mgr, _) = manager(node);
        let record = SubmissionRecord {
            request_id: RequestId([1; 32]),
            nonce: 0,
            attempt: 3,
            transaction_hash: None,
            outcome: SubmissionOutcome::SubmissionError,
            submitted_at: Utc::now(),
            last_error: None,
        };
        assert_eq!(mgr.await_confirmation(&record).await, SubmissionOutcome::SubmissionError);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..50 {
            let d = jittered(base);
            assert!(d >= base && d <= Duration::from_millis(500));
        }
        assert_eq!(jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }
}
