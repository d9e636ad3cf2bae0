//! Off-chain credit oracle
//!
//! Watches a lending contract for loan requests, scores each borrower from
//! off-chain signals and writes the decision back with a signed transaction.

pub mod chain;
pub mod config;
pub mod models;
pub mod oracle;
pub mod providers;
pub mod status;

pub use config::{ConfigError, ConfigViolation, OracleConfig};
pub use models::*;
