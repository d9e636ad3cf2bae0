//! Oracle configuration
//!
//! Everything comes from environment variables (optionally loaded from a
//! `.env` file first). Validation collects every problem before failing so
//! the operator can fix the whole environment in one pass.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::chain::{EventSourceConfig, LocalKeySigner};
use crate::models::{Address, MAX_SCORE, MIN_SCORE};
use crate::oracle::features::{FeatureConfig, InterestTiers};
use crate::oracle::ledger::DEFAULT_LEDGER_CAPACITY;
use crate::oracle::policy::DEFAULT_APPROVAL_THRESHOLD;
use crate::oracle::scoring::{parse_override_rules, ScoringConfig};
use crate::oracle::{LoopConfig, SubmissionConfig};
use crate::providers::PriceFeedConfig;

/// A single configuration problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    /// Environment variable at fault
    pub field: String,
    pub description: String,
    pub suggestion: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.field, self.description, self.suggestion)
    }
}

/// Every violation found while loading configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub violations: Vec<ConfigViolation>,
}

impl ConfigError {
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Oracle configuration INVALID:")?;
        for v in &self.violations {
            writeln!(f, "  - {}", v)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

/// A string that never shows up in logs or debug output
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString(***)")
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub rpc_url: String,
    pub private_key: SecretString,
    pub contract_address: Address,
    /// Expected chain id. Queried from the node when unset.
    pub chain_id: Option<u64>,
    pub approval_threshold: u16,
    pub features: FeatureConfig,
    pub price_feed: PriceFeedConfig,
    pub social_api_url: Option<String>,
    pub scoring: ScoringConfig,
    pub rpc_timeout: Duration,
    pub submission: SubmissionConfig,
    pub events: EventSourceConfig,
    pub loop_config: LoopConfig,
    pub ledger_capacity: usize,
    /// Evicted request ids still rejected as duplicates
    pub ledger_tombstones: usize,
    /// Status server port. Disabled when unset.
    pub status_port: Option<u16>,
}

/// Reads variables through a lookup function and records what is wrong.
struct EnvReader<F> {
    lookup: F,
    violations: Vec<ConfigViolation>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            violations: Vec::new(),
        }
    }

    fn violation(&mut self, field: &str, description: impl Into<String>, suggestion: impl Into<String>) {
        self.violations.push(ConfigViolation {
            field: field.to_string(),
            description: description.into(),
            suggestion: suggestion.into(),
        });
    }

    /// Non-empty trimmed value, if set
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&mut self, name: &str, suggestion: &str) -> Option<String> {
        let value = self.raw(name);
        if value.is_none() {
            self.violation(name, "missing required variable", suggestion);
        }
        value
    }

    fn optional<T>(&mut self, name: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.raw(name)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                self.violation(
                    name,
                    format!("cannot parse '{}': {}", raw, e),
                    format!("set {} to a valid {}", name, std::any::type_name::<T>()),
                );
                None
            }
        }
    }

    fn parsed<T>(&mut self, name: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.optional(name).unwrap_or(default)
    }

    fn flag(&mut self, name: &str, default: bool) -> bool {
        match self.raw(name) {
            None => default,
            Some(v) if matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON" | "yes") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "FALSE" | "off" | "OFF" | "no") => false,
            Some(v) => {
                self.violation(name, format!("'{}' is not a boolean", v), "use true/false");
                default
            }
        }
    }

    fn millis(&mut self, name: &str, default: Duration) -> Duration {
        let ms: u64 = self.parsed(name, default.as_millis() as u64);
        if ms == 0 {
            self.violation(name, "must be greater than zero", "use a positive number of milliseconds");
            return default;
        }
        Duration::from_millis(ms)
    }
}

impl OracleConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = EnvReader::new(lookup);

        // Required
        let rpc_url = env.required("RPC_URL", "set RPC_URL to the node's HTTP JSON-RPC endpoint");
        if let Some(url) = &rpc_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                env.violation("RPC_URL", format!("'{}' is not an HTTP(S) URL", url), "use http:// or https://");
            }
        }

        let private_key = env.required("PRIVATE_KEY", "set PRIVATE_KEY to the oracle account's hex key");
        if let Some(key) = &private_key {
            if let Err(e) = LocalKeySigner::from_hex(key) {
                env.violation("PRIVATE_KEY", format!("invalid key: {}", e), "use a 32-byte hex secp256k1 key");
            }
        }

        let contract_address = match env.required("CONTRACT_ADDRESS", "set CONTRACT_ADDRESS to the lending contract") {
            Some(raw) => match raw.parse::<Address>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    env.violation("CONTRACT_ADDRESS", e.to_string(), "use a 0x-prefixed 20-byte address");
                    None
                }
            },
            None => None,
        };

        let chain_id = env.optional::<u64>("CHAIN_ID");

        // Decision policy
        let approval_threshold = env.parsed("APPROVAL_THRESHOLD", DEFAULT_APPROVAL_THRESHOLD);
        if !(MIN_SCORE..=MAX_SCORE).contains(&approval_threshold) {
            env.violation(
                "APPROVAL_THRESHOLD",
                format!("{} is outside the score range", approval_threshold),
                format!("use a value in [{}, {}]", MIN_SCORE, MAX_SCORE),
            );
        }

        // Valuation
        let default_tiers = InterestTiers::default();
        let tiers = InterestTiers {
            thresholds: [
                env.parsed("TIER_HIGH_THRESHOLD", default_tiers.thresholds[0]),
                env.parsed("TIER_MID_THRESHOLD", default_tiers.thresholds[1]),
                env.parsed("TIER_LOW_THRESHOLD", default_tiers.thresholds[2]),
            ],
            rates_pct: [
                env.parsed("TIER_HIGH_RATE_PCT", default_tiers.rates_pct[0]),
                env.parsed("TIER_MID_RATE_PCT", default_tiers.rates_pct[1]),
                env.parsed("TIER_LOW_RATE_PCT", default_tiers.rates_pct[2]),
            ],
            base_rate_pct: env.parsed("TIER_BASE_RATE_PCT", default_tiers.base_rate_pct),
        };
        if let Err(e) = tiers.validate() {
            env.violation("TIER_*", e.to_string(), "thresholds must decrease and rates must not");
        }

        let feature_defaults = FeatureConfig::default();
        let fallback_native_price =
            env.parsed("FALLBACK_NATIVE_PRICE", feature_defaults.fallback_native_price);
        if !fallback_native_price.is_finite() || fallback_native_price <= 0.0 {
            env.violation("FALLBACK_NATIVE_PRICE", "must be a positive number", "e.g. 200000");
        }
        let provider_timeout = env.millis("PROVIDER_TIMEOUT_MS", feature_defaults.provider_timeout);

        let price_defaults = PriceFeedConfig::default();
        let price_feed = PriceFeedConfig {
            api_url: env.raw("PRICE_API_URL").unwrap_or(price_defaults.api_url),
            coin_id: env.raw("PRICE_COIN_ID").unwrap_or(price_defaults.coin_id),
            vs_currency: env
                .raw("PRICE_VS_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(price_defaults.vs_currency),
        };
        let social_api_url = env.raw("SOCIAL_API_URL");

        // Scoring
        let overrides_enabled = env.flag("SCORE_OVERRIDES_ENABLED", false);
        let overrides = match env.raw("SCORE_OVERRIDES") {
            Some(raw) => match parse_override_rules(&raw) {
                Ok(rules) => rules,
                Err(e) => {
                    env.violation("SCORE_OVERRIDES", format!("{:#}", e), "use pattern=score pairs, e.g. ether=850,sample=500");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let model_path = env.raw("MODEL_PATH").map(PathBuf::from);

        // Submission
        let submission_defaults = SubmissionConfig::default();
        let rpc_timeout = env.millis("RPC_TIMEOUT_MS", submission_defaults.rpc_timeout);
        let max_attempts: u32 = env.parsed("SUBMIT_MAX_ATTEMPTS", submission_defaults.max_attempts);
        if max_attempts == 0 {
            env.violation("SUBMIT_MAX_ATTEMPTS", "must be at least 1", "e.g. 3");
        }
        let initial_backoff = env.millis("SUBMIT_BACKOFF_MS", submission_defaults.initial_backoff);
        let gas_limit: u64 = env.parsed("GAS_LIMIT", submission_defaults.gas_limit);
        if gas_limit < 21_000 {
            env.violation("GAS_LIMIT", format!("{} is below the intrinsic gas cost", gas_limit), "e.g. 2000000");
        }
        let confirmation_secs: u64 = env.parsed(
            "CONFIRMATION_TIMEOUT_SECS",
            submission_defaults.confirmation_timeout.as_secs(),
        );
        if confirmation_secs == 0 {
            env.violation("CONFIRMATION_TIMEOUT_SECS", "must be greater than zero", "e.g. 120");
        }
        let receipt_poll_interval =
            env.millis("RECEIPT_POLL_INTERVAL_MS", submission_defaults.receipt_poll_interval);

        // Event polling
        let event_defaults = EventSourceConfig::default();
        let events = EventSourceConfig {
            start_block: env.optional("START_BLOCK"),
            overlap_blocks: env.parsed("LOG_OVERLAP_BLOCKS", event_defaults.overlap_blocks),
            max_block_range: env.parsed("LOG_MAX_BLOCK_RANGE", event_defaults.max_block_range),
        };
        if events.max_block_range == 0 {
            env.violation("LOG_MAX_BLOCK_RANGE", "must be greater than zero", "e.g. 2000");
        }

        // Loop
        let loop_defaults = LoopConfig::default();
        let poll_interval = env.millis("POLL_INTERVAL_MS", loop_defaults.poll_interval);
        let evaluation_concurrency: usize =
            env.parsed("EVALUATION_CONCURRENCY", loop_defaults.evaluation_concurrency);
        if evaluation_concurrency == 0 {
            env.violation("EVALUATION_CONCURRENCY", "must be at least 1", "e.g. 4");
        }
        let ledger_capacity: usize = env.parsed("LEDGER_CAPACITY", DEFAULT_LEDGER_CAPACITY);
        if ledger_capacity == 0 {
            env.violation("LEDGER_CAPACITY", "must be at least 1", "e.g. 10000");
        }
        let ledger_tombstones: usize = env.parsed("LEDGER_TOMBSTONE_CAPACITY", ledger_capacity);
        let status_port = env.optional::<u16>("STATUS_PORT");

        if !env.violations.is_empty() {
            return Err(ConfigError {
                violations: env.violations,
            });
        }

        // All three are Some when no violation was recorded
        let (Some(rpc_url), Some(private_key), Some(contract_address)) =
            (rpc_url, private_key, contract_address)
        else {
            return Err(ConfigError {
                violations: vec![ConfigViolation {
                    field: "RPC_URL/PRIVATE_KEY/CONTRACT_ADDRESS".to_string(),
                    description: "missing required variable".to_string(),
                    suggestion: "set all required variables".to_string(),
                }],
            });
        };

        Ok(Self {
            rpc_url,
            private_key: SecretString::new(private_key),
            contract_address,
            chain_id,
            approval_threshold,
            features: FeatureConfig {
                provider_timeout,
                fallback_native_price,
                tiers,
            },
            price_feed,
            social_api_url,
            scoring: ScoringConfig {
                overrides_enabled,
                overrides,
                model_path,
            },
            rpc_timeout,
            submission: SubmissionConfig {
                max_attempts,
                initial_backoff,
                max_backoff: submission_defaults.max_backoff.max(initial_backoff),
                gas_limit,
                rpc_timeout,
                confirmation_timeout: Duration::from_secs(confirmation_secs),
                receipt_poll_interval,
            },
            events,
            loop_config: LoopConfig {
                poll_interval,
                evaluation_concurrency,
            },
            ledger_capacity,
            ledger_tombstones,
            status_port,
        })
    }

    /// Log the effective configuration. Secrets are never printed.
    pub fn log_summary(&self) {
        info!(
            rpc_url = %self.rpc_url,
            contract = %self.contract_address,
            chain_id = ?self.chain_id,
            "⚙️ Ledger connection"
        );
        info!(
            approval_threshold = self.approval_threshold,
            tiers = ?self.features.tiers.thresholds,
            rates_pct = ?self.features.tiers.rates_pct,
            base_rate_pct = self.features.tiers.base_rate_pct,
            fallback_price = self.features.fallback_native_price,
            currency = %self.price_feed.vs_currency,
            "⚙️ Decision policy"
        );
        info!(
            model = ?self.scoring.model_path,
            social_api = ?self.social_api_url,
            provider_timeout_ms = self.features.provider_timeout.as_millis() as u64,
            "⚙️ Scoring"
        );
        info!(
            poll_ms = self.loop_config.poll_interval.as_millis() as u64,
            concurrency = self.loop_config.evaluation_concurrency,
            max_attempts = self.submission.max_attempts,
            gas_limit = self.submission.gas_limit,
            confirmation_secs = self.submission.confirmation_timeout.as_secs(),
            start_block = ?self.events.start_block,
            status_port = ?self.status_port,
            "⚙️ Runtime"
        );
        if self.scoring.overrides_enabled {
            warn!("⚠️ SCORE_OVERRIDES_ENABLED is set: names matching override rules bypass scoring");
        }
    }
}
