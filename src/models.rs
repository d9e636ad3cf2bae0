//! Core domain types shared across the oracle pipeline
//!
//! Identifiers are fixed-width byte arrays rendered as `0x`-prefixed lowercase
//! hex everywhere they leave the process (logs, status API, JSON-RPC).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wei per native unit (18 decimals)
pub const WEI_PER_NATIVE: f64 = 1e18;

/// Lower bound of the credit score domain
pub const MIN_SCORE: u16 = 300;
/// Upper bound of the credit score domain
pub const MAX_SCORE: u16 = 850;

macro_rules! hex_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.trim();
                let raw = raw
                    .strip_prefix("0x")
                    .or_else(|| raw.strip_prefix("0X"))
                    .unwrap_or(raw);
                let bytes = hex::decode(raw)
                    .map_err(|e| anyhow::anyhow!("invalid hex for {}: {}", stringify!($name), e))?;
                let arr: [u8; $len] = bytes.as_slice().try_into().map_err(|_| {
                    anyhow::anyhow!(
                        "{} must be {} bytes, got {}",
                        stringify!($name),
                        $len,
                        bytes.len()
                    )
                })?;
                Ok(Self(arr))
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_hex()
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

hex_newtype!(
    /// Opaque 32-byte request identifier assigned by the lending contract
    RequestId,
    32
);
hex_newtype!(
    /// 20-byte account address
    Address,
    20
);
hex_newtype!(
    /// Keccak-256 hash of a signed transaction
    TxHash,
    32
);

/// Convert a wei amount to native units.
pub fn wei_to_native(wei: u128) -> f64 {
    wei as f64 / WEI_PER_NATIVE
}

/// Which contract event stream a request was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStream {
    /// `LoanRequested`
    Standard,
    /// `DebugLoanRequested`, carries a balance override
    Debug,
}

impl fmt::Display for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

/// A loan request as emitted by the contract. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRequest {
    pub request_id: RequestId,
    pub borrower: Address,
    /// Requested amount in wei
    pub amount_wei: u128,
    /// Declared name, may be empty
    pub ens_name: String,
    /// Balance substitute in wei. Only ever set from the debug stream.
    pub test_balance_override: Option<u128>,
}

impl LoanRequest {
    pub fn amount_native(&self) -> f64 {
        wei_to_native(self.amount_wei)
    }
}

/// A request together with where it was seen on-chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub request: LoanRequest,
    pub stream: EventStream,
    pub block_number: u64,
    pub log_index: u64,
}

/// Why a request ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Receipt reported an on-chain revert. Never retried automatically.
    Reverted,
    /// No receipt before the confirmation timeout. Eligible for manual re-submission.
    Unconfirmed,
    /// Every submission attempt failed before the node accepted the transaction
    SubmissionExhausted(String),
    /// Any other error raised while processing the request
    Pipeline(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reverted => write!(f, "reverted"),
            Self::Unconfirmed => write!(f, "unconfirmed"),
            Self::SubmissionExhausted(detail) => write!(f, "submission exhausted: {}", detail),
            Self::Pipeline(detail) => write!(f, "pipeline error: {}", detail),
        }
    }
}

/// Lifecycle of a single request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RequestState {
    Detected,
    Scoring,
    Decided,
    Submitting,
    Confirmed,
    Failed(FailureReason),
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Scoring => "scoring",
            Self::Decided => "decided",
            Self::Submitting => "submitting",
            Self::Confirmed => "confirmed",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({})", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Whether the loan valuation came from the live price feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationSource {
    Live,
    Fallback,
}

/// Borrower signals computed fresh for each request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    /// Balance in native units
    pub balance_native: f64,
    pub transaction_count: u64,
    pub days_active: u32,
    pub has_social_link: bool,
    /// Requested amount converted to the reference currency
    pub loan_value_reference: f64,
    /// Valuation tier rate, in percent
    pub base_interest_rate_pct: f64,
    pub valuation_source: ValuationSource,
}

/// Which scorer produced a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreSource {
    Override,
    Model,
    RuleBased,
}

impl fmt::Display for ScoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override => write!(f, "override"),
            Self::Model => write!(f, "model"),
            Self::RuleBased => write!(f, "rule-based"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreResult {
    pub value: u16,
    pub source: ScoreSource,
}

impl ScoreResult {
    /// Build a result with `raw` clamped into the score domain.
    pub fn clamped(raw: i64, source: ScoreSource) -> Self {
        Self {
            value: clamp_score(raw),
            source,
        }
    }
}

pub fn clamp_score(raw: i64) -> u16 {
    raw.clamp(MIN_SCORE as i64, MAX_SCORE as i64) as u16
}

/// Outcome of the decision policy, written back to the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub score: ScoreResult,
    pub approved: bool,
    pub interest_rate_bps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionOutcome {
    Pending,
    Confirmed,
    Reverted,
    SubmissionError,
}

impl fmt::Display for SubmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Reverted => write!(f, "reverted"),
            Self::SubmissionError => write!(f, "submission-error"),
        }
    }
}

/// Last known submission of a fulfillment transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionRecord {
    pub request_id: RequestId,
    pub nonce: u64,
    /// 1-based attempt number that produced this record
    pub attempt: u32,
    pub transaction_hash: Option<TxHash>,
    pub outcome: SubmissionOutcome,
    pub submitted_at: DateTime<Utc>,
    pub last_error: Option<String>,
}
