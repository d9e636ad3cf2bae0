//! Request-processing pipeline
//!
//! ledger -> features -> scoring -> policy -> submission, driven by the runner.

pub mod features;
pub mod ledger;
pub mod nonce;
pub mod policy;
pub mod runner;
pub mod scoring;
pub mod stats;
pub mod submission;

pub use features::{FeatureAggregator, FeatureConfig, InterestTiers};
pub use ledger::{Admission, LedgerEntry, LedgerError, RequestLedger};
pub use nonce::NonceSequencer;
pub use policy::DecisionPolicy;
pub use runner::{LoopConfig, OracleContext, OracleLoop, TickSummary};
pub use scoring::{
    LinearModel, ModelScorer, OverrideRule, OverrideScorer, RuleBasedScorer, Scorer, ScorerError,
    ScoringChain, ScoringConfig,
};
pub use stats::{OracleStats, OracleStatsSnapshot};
pub use submission::{SubmissionConfig, SubmissionManager};
