//! In-process collaborators for pipeline tests

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use credit_oracle::chain::{
    ContractReader, EventSource, LedgerClient, LocalKeySigner, OnChainLoanRequest, RpcError,
    TransactionReceipt, TransactionSigner,
};
use credit_oracle::models::{Address, EventStream, LoanRequest, ObservedEvent, RequestId, TxHash};
use credit_oracle::oracle::{
    DecisionPolicy, FeatureAggregator, FeatureConfig, LoopConfig, NonceSequencer, OracleContext,
    OracleLoop, OracleStats, RequestLedger, ScoringChain, ScoringConfig, SubmissionConfig,
    SubmissionManager,
};
use credit_oracle::providers::{AccountInfoProvider, PriceProvider, SocialLinkProvider};

pub const WEI: u128 = 1_000_000_000_000_000_000;
pub const ORACLE_KEY: &str = "4646464646464646464646464646464646464646464646464646464646464646";

pub fn loan(id: u8, amount_native: u128, name: &str) -> LoanRequest {
    LoanRequest {
        request_id: RequestId([id; 32]),
        borrower: Address([id; 20]),
        amount_wei: amount_native * WEI,
        ens_name: name.to_string(),
        test_balance_override: None,
    }
}

pub fn observed(request: LoanRequest, stream: EventStream, block: u64, log_index: u64) -> ObservedEvent {
    ObservedEvent {
        request,
        stream,
        block_number: block,
        log_index,
    }
}

// ============================================================================
// Event sources
// ============================================================================

/// Hands out one scripted batch per poll, then nothing.
pub struct ScriptedSource {
    name: String,
    batches: Mutex<VecDeque<Result<Vec<ObservedEvent>>>>,
    pub polls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(name: &str, batches: Vec<Result<Vec<ObservedEvent>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            batches: Mutex::new(batches.into()),
            polls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<Vec<ObservedEvent>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// Providers
// ============================================================================

pub struct StaticAccount {
    pub balance_wei: u128,
    pub tx_count: u64,
    pub fail: bool,
    pub panic: bool,
}

impl StaticAccount {
    pub fn new(balance_wei: u128, tx_count: u64) -> Self {
        Self {
            balance_wei,
            tx_count,
            fail: false,
            panic: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0, 0)
        }
    }
}

#[async_trait]
impl AccountInfoProvider for StaticAccount {
    async fn balance(&self, _account: &Address) -> Result<u128> {
        if self.panic {
            panic!("account provider blew up");
        }
        if self.fail {
            return Err(anyhow!("node unavailable"));
        }
        Ok(self.balance_wei)
    }

    async fn transaction_count(&self, _account: &Address) -> Result<u64> {
        if self.fail {
            return Err(anyhow!("node unavailable"));
        }
        Ok(self.tx_count)
    }
}

pub struct StaticSocial {
    pub linked_names: HashSet<String>,
}

impl StaticSocial {
    pub fn linking(names: &[&str]) -> Self {
        Self {
            linked_names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

#[async_trait]
impl SocialLinkProvider for StaticSocial {
    async fn linked_platforms(&self, name: &str) -> Result<Vec<String>> {
        if self.linked_names.contains(name) {
            Ok(vec!["twitter".to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}

pub struct StaticPrice(pub Option<f64>);

#[async_trait]
impl PriceProvider for StaticPrice {
    async fn native_price(&self) -> Result<f64> {
        self.0.ok_or_else(|| anyhow!("price feed unavailable"))
    }
}

// ============================================================================
// Ledger node
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Success,
    Revert,
    Never,
}

/// A node that accepts every transaction and mines them per `receipts`.
pub struct MockNode {
    pub pending: AtomicU64,
    pub receipts: Mutex<ReceiptMode>,
    pub send_failures: Mutex<VecDeque<RpcError>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
    sends: AtomicUsize,
}

impl MockNode {
    pub fn new(receipts: ReceiptMode) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicU64::new(0),
            receipts: Mutex::new(receipts),
            send_failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl LedgerClient for MockNode {
    async fn pending_nonce(&self, _account: &Address) -> Result<u64, RpcError> {
        Ok(self.pending.load(Ordering::SeqCst))
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        Ok(20_000_000_000)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, RpcError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.send_failures.lock().pop_front() {
            return Err(err);
        }
        self.sent.lock().push(raw.to_vec());
        let n = self.sent.lock().len() as u8;
        Ok(TxHash([n; 32]))
    }

    async fn transaction_receipt(&self, _hash: &TxHash) -> Result<Option<TransactionReceipt>, RpcError> {
        let receipt = match *self.receipts.lock() {
            ReceiptMode::Success => Some(TransactionReceipt {
                success: true,
                block_number: Some(100),
            }),
            ReceiptMode::Revert => Some(TransactionReceipt {
                success: false,
                block_number: Some(100),
            }),
            ReceiptMode::Never => None,
        };
        Ok(receipt)
    }

    async fn is_transaction_known(&self, _hash: &TxHash) -> Result<bool, RpcError> {
        Ok(false)
    }
}

/// Contract view where only `processed` ids have results
#[derive(Default)]
pub struct MockContract {
    pub processed: Mutex<HashSet<RequestId>>,
    pub fail_reads: bool,
}

#[async_trait]
impl ContractReader for MockContract {
    async fn loan_request(&self, request_id: &RequestId) -> Result<OnChainLoanRequest> {
        if self.fail_reads {
            return Err(anyhow!("eth_call failed"));
        }
        Ok(OnChainLoanRequest {
            borrower: Address([0; 20]),
            amount_wei: 0,
            ens_name: String::new(),
            processed: self.processed.lock().contains(request_id),
            credit_score: 0,
            approved: false,
        })
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Harness {
    pub ctx: Arc<OracleContext>,
    pub node: Arc<MockNode>,
    pub contract: Arc<MockContract>,
}

pub struct HarnessBuilder {
    pub account: StaticAccount,
    pub social: StaticSocial,
    pub price: Option<f64>,
    pub receipts: ReceiptMode,
    pub scoring: ScoringConfig,
    pub contract: MockContract,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            account: StaticAccount::new(0, 0),
            social: StaticSocial::linking(&[]),
            price: Some(200_000.0),
            receipts: ReceiptMode::Success,
            scoring: ScoringConfig::default(),
            contract: MockContract::default(),
        }
    }
}

pub fn fast_submission_config() -> SubmissionConfig {
    SubmissionConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        gas_limit: 2_000_000,
        rpc_timeout: Duration::from_millis(500),
        confirmation_timeout: Duration::from_millis(60),
        receipt_poll_interval: Duration::from_millis(5),
    }
}

impl HarnessBuilder {
    pub fn build(self) -> Harness {
        let stats = Arc::new(OracleStats::default());
        let node = MockNode::new(self.receipts);
        let contract = Arc::new(self.contract);

        let aggregator = FeatureAggregator::new(
            Arc::new(self.account),
            Arc::new(self.social),
            Arc::new(StaticPrice(self.price)),
            FeatureConfig {
                provider_timeout: Duration::from_millis(200),
                ..FeatureConfig::default()
            },
        )
        .with_stats(stats.clone());

        let signer = Arc::new(LocalKeySigner::from_hex(ORACLE_KEY).unwrap());
        let nonces = Arc::new(NonceSequencer::new(
            node.clone(),
            signer.address(),
            Duration::from_millis(500),
        ));
        let submissions = SubmissionManager::new(
            node.clone(),
            signer,
            nonces,
            Address([0xcc; 20]),
            31337,
            fast_submission_config(),
        )
        .with_stats(stats.clone());

        let ctx = Arc::new(OracleContext {
            ledger: Arc::new(RequestLedger::default()),
            aggregator,
            scoring: ScoringChain::from_config(&self.scoring).with_stats(stats.clone()),
            policy: DecisionPolicy::default(),
            submissions,
            contract: Some(contract.clone() as Arc<dyn ContractReader>),
            stats,
        });

        Harness {
            ctx,
            node,
            contract,
        }
    }
}

impl Harness {
    pub fn oracle(&self, sources: Vec<Arc<ScriptedSource>>) -> OracleLoop {
        let sources = sources
            .into_iter()
            .map(|s| s as Arc<dyn EventSource>)
            .collect();
        OracleLoop::new(
            self.ctx.clone(),
            sources,
            LoopConfig {
                poll_interval: Duration::from_millis(10),
                evaluation_concurrency: 4,
            },
        )
    }
}
