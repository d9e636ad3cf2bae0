//! Ledger node adapter
//!
//! Everything that talks to the chain lives here:
//! - `rpc`: JSON-RPC client over HTTP
//! - `abi`: hand-rolled codec for the lending contract's events and calls
//! - `signer`: legacy EIP-155 transaction signing with a local key
//! - `events`: block-cursor polling of the two loan request streams
//!
//! The pipeline only depends on the traits declared below, so tests can swap
//! the node out entirely.

pub mod abi;
pub mod events;
pub mod rpc;
pub mod signer;

use async_trait::async_trait;
use std::fmt;

use crate::models::{Address, RequestId, TxHash};

pub use abi::OnChainLoanRequest;
pub use events::{ContractEventSource, EventSource, EventSourceConfig};
pub use rpc::RpcClient;
pub use signer::{LegacyTransaction, LocalKeySigner, SignedTransaction, TransactionSigner};

/// Errors from a JSON-RPC round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Connection/HTTP failure. The request may or may not have reached the node.
    Transport(String),
    /// No response within the client timeout. Also ambiguous.
    Timeout,
    /// The node answered with a JSON-RPC error object
    Node { code: i64, message: String },
    /// The node answered with something we could not interpret
    Decode(String),
}

impl RpcError {
    /// True when the caller cannot tell whether the node processed the request.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::Decode(_))
    }

    pub fn is_nonce_too_low(&self) -> bool {
        match self {
            Self::Node { message, .. } => {
                let m = message.to_lowercase();
                m.contains("nonce too low") || m.contains("nonce has already been used")
            }
            _ => false,
        }
    }

    /// The node already holds this exact transaction in its pool.
    pub fn is_already_known(&self) -> bool {
        match self {
            Self::Node { message, .. } => {
                let m = message.to_lowercase();
                m.contains("already known") || m.contains("known transaction")
            }
            _ => false,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Timeout => write!(f, "request timed out"),
            Self::Node { code, message } => write!(f, "node error {}: {}", code, message),
            Self::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for RpcError {}

/// Receipt of a mined transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionReceipt {
    /// `status == 1`
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Node operations needed to submit and track fulfillment transactions
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Transaction count of `account` including pending transactions
    async fn pending_nonce(&self, account: &Address) -> Result<u64, RpcError>;

    async fn gas_price(&self) -> Result<u128, RpcError>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, RpcError>;

    /// `Ok(None)` while the transaction is not mined yet
    async fn transaction_receipt(&self, hash: &TxHash)
        -> Result<Option<TransactionReceipt>, RpcError>;

    /// Whether the node knows the transaction at all (pool or chain)
    async fn is_transaction_known(&self, hash: &TxHash) -> Result<bool, RpcError>;
}

/// Read-only view of the lending contract, used for reconciliation
#[async_trait]
pub trait ContractReader: Send + Sync {
    async fn loan_request(&self, request_id: &RequestId) -> anyhow::Result<OnChainLoanRequest>;
}
