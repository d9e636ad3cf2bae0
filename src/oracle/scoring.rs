//! Credit scoring
//!
//! Scorers are tried in a fixed order:
//! 1. name overrides (only when enabled in configuration)
//! 2. a linear model loaded from JSON, if one is configured
//! 3. the rule-based scorer, which always produces a result
//!
//! A scorer that does not apply, errors, or panics hands over to the next one.
//! Every result is clamped to [300, 850].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::stats::OracleStats;
use crate::models::{FeatureVector, LoanRequest, ScoreResult, ScoreSource, MAX_SCORE, MIN_SCORE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScorerError {
    /// The scorer has nothing to say about this request
    NotApplicable,
    Failed(String),
}

impl fmt::Display for ScorerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotApplicable => write!(f, "not applicable"),
            Self::Failed(e) => write!(f, "scorer failed: {}", e),
        }
    }
}

impl std::error::Error for ScorerError {}

pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, request: &LoanRequest, features: &FeatureVector)
        -> Result<ScoreResult, ScorerError>;
}

// ============================================================================
// Overrides
// ============================================================================

/// Fixed score for names containing `pattern` (case-insensitive)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRule {
    pub pattern: String,
    pub score: u16,
}

impl OverrideRule {
    pub fn new(pattern: &str, score: u16) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
            score,
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![Self::new("ether", 850), Self::new("sample", 500)]
    }
}

/// Parse `pattern=score` pairs separated by commas, e.g. `ether=850,sample=500`.
pub fn parse_override_rules(raw: &str) -> Result<Vec<OverrideRule>> {
    let mut rules = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (pattern, score) = pair
            .split_once('=')
            .with_context(|| format!("override '{}' is not pattern=score", pair))?;
        let pattern = pattern.trim();
        if pattern.is_empty() {
            bail!("override '{}' has an empty pattern", pair);
        }
        let score: u16 = score
            .trim()
            .parse()
            .with_context(|| format!("override '{}' has a non-numeric score", pair))?;
        if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
            bail!(
                "override score {} for '{}' is outside [{}, {}]",
                score,
                pattern,
                MIN_SCORE,
                MAX_SCORE
            );
        }
        rules.push(OverrideRule::new(pattern, score));
    }
    Ok(rules)
}

pub struct OverrideScorer {
    rules: Vec<OverrideRule>,
}

impl OverrideScorer {
    pub fn new(rules: Vec<OverrideRule>) -> Self {
        Self { rules }
    }
}

impl Scorer for OverrideScorer {
    fn name(&self) -> &str {
        "override"
    }

    fn score(&self, request: &LoanRequest, _features: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        if request.ens_name.is_empty() {
            return Err(ScorerError::NotApplicable);
        }
        let name = request.ens_name.to_lowercase();
        self.rules
            .iter()
            .find(|rule| name.contains(&rule.pattern))
            .map(|rule| ScoreResult::clamped(rule.score as i64, ScoreSource::Override))
            .ok_or(ScorerError::NotApplicable)
    }
}

// ============================================================================
// Linear model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFeature {
    BalanceNative,
    TransactionCount,
    DaysActive,
    HasSocialLink,
    LoanValueReference,
}

impl ModelFeature {
    fn value(self, features: &FeatureVector) -> f64 {
        match self {
            Self::BalanceNative => features.balance_native,
            Self::TransactionCount => features.transaction_count as f64,
            Self::DaysActive => features.days_active as f64,
            Self::HasSocialLink => {
                if features.has_social_link {
                    1.0
                } else {
                    0.0
                }
            }
            Self::LoanValueReference => features.loan_value_reference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Linear,
    /// `ln(1 + max(x, 0))`
    Log1p,
}

impl Transform {
    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Linear => x,
            Self::Log1p => x.max(0.0).ln_1p(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelTerm {
    pub feature: ModelFeature,
    #[serde(default)]
    pub transform: Transform,
    pub weight: f64,
}

/// `score = intercept + sum(weight * transform(feature))`
///
/// ```json
/// {
///   "intercept": 520.0,
///   "terms": [
///     { "feature": "balance_native", "transform": "log1p", "weight": 40.0 },
///     { "feature": "has_social_link", "weight": 50.0 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub terms: Vec<ModelTerm>,
}

impl LinearModel {
    pub fn from_json(raw: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(raw).context("invalid model JSON")?;
        if !model.intercept.is_finite() || model.terms.iter().any(|t| !t.weight.is_finite()) {
            bail!("model coefficients must be finite");
        }
        Ok(model)
    }

    pub fn predict(&self, features: &FeatureVector) -> f64 {
        self.terms.iter().fold(self.intercept, |acc, term| {
            acc + term.weight * term.transform.apply(term.feature.value(features))
        })
    }
}

pub struct ModelScorer {
    model: LinearModel,
    origin: String,
}

impl ModelScorer {
    pub fn new(model: LinearModel, origin: impl Into<String>) -> Self {
        Self {
            model,
            origin: origin.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model file {}", path.display()))?;
        let model = LinearModel::from_json(&raw)
            .with_context(|| format!("failed to load model from {}", path.display()))?;
        Ok(Self::new(model, path.display().to_string()))
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl Scorer for ModelScorer {
    fn name(&self) -> &str {
        "model"
    }

    fn score(&self, _request: &LoanRequest, features: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        let raw = self.model.predict(features);
        if !raw.is_finite() {
            return Err(ScorerError::Failed(format!("model produced {}", raw)));
        }
        Ok(ScoreResult::clamped(raw.trunc() as i64, ScoreSource::Model))
    }
}

// ============================================================================
// Rule-based fallback
// ============================================================================

pub struct RuleBasedScorer;

impl RuleBasedScorer {
    pub const BASE: i64 = 600;
    pub const SOCIAL_BONUS: i64 = 50;
    pub const BALANCE_BONUS: i64 = 50;
    pub const ACTIVITY_BONUS: i64 = 30;

    pub fn compute(features: &FeatureVector) -> ScoreResult {
        let mut score = Self::BASE;
        if features.has_social_link {
            score += Self::SOCIAL_BONUS;
        }
        if features.balance_native > 1.0 {
            score += Self::BALANCE_BONUS;
        }
        if features.transaction_count > 10 {
            score += Self::ACTIVITY_BONUS;
        }
        ScoreResult::clamped(score, ScoreSource::RuleBased)
    }
}

impl Scorer for RuleBasedScorer {
    fn name(&self) -> &str {
        "rule-based"
    }

    fn score(&self, _request: &LoanRequest, features: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        Ok(Self::compute(features))
    }
}

// ============================================================================
// Chain
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ScoringConfig {
    pub overrides_enabled: bool,
    /// Rules used when overrides are enabled. Empty means the built-in defaults.
    pub overrides: Vec<OverrideRule>,
    pub model_path: Option<PathBuf>,
}

pub struct ScoringChain {
    stages: Vec<Box<dyn Scorer>>,
    stats: Arc<OracleStats>,
}

impl ScoringChain {
    /// Build from explicit stages. The rule-based scorer is always appended.
    pub fn new(mut stages: Vec<Box<dyn Scorer>>) -> Self {
        stages.push(Box::new(RuleBasedScorer));
        Self {
            stages,
            stats: Arc::new(OracleStats::default()),
        }
    }

    pub fn from_config(config: &ScoringConfig) -> Self {
        let mut stages: Vec<Box<dyn Scorer>> = Vec::new();

        if config.overrides_enabled {
            let rules = if config.overrides.is_empty() {
                OverrideRule::defaults()
            } else {
                config.overrides.clone()
            };
            warn!(rules = rules.len(), "⚠️ Score overrides are ENABLED");
            stages.push(Box::new(OverrideScorer::new(rules)));
        }

        if let Some(path) = &config.model_path {
            match ModelScorer::load(path) {
                Ok(model) => {
                    info!(path = %path.display(), terms = model.model.terms.len(), "✅ Scoring model loaded");
                    stages.push(Box::new(model));
                }
                Err(e) => warn!(error = %e, "⚠️ Scoring model unavailable, using rule-based scoring"),
            }
        }

        Self::new(stages)
    }

    pub fn with_stats(mut self, stats: Arc<OracleStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn score(&self, request: &LoanRequest, features: &FeatureVector) -> ScoreResult {
        for stage in &self.stages {
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.score(request, features)));
            match outcome {
                Ok(Ok(result)) => {
                    let result = ScoreResult::clamped(result.value as i64, result.source);
                    debug!(request_id = %request.request_id, scorer = stage.name(), score = result.value, "scored");
                    return result;
                }
                Ok(Err(ScorerError::NotApplicable)) => continue,
                Ok(Err(e)) => {
                    OracleStats::incr(&self.stats.scorer_fallbacks);
                    warn!(request_id = %request.request_id, scorer = stage.name(), error = %e, "⚠️ Scorer failed, falling back");
                }
                Err(_) => {
                    OracleStats::incr(&self.stats.scorer_fallbacks);
                    warn!(request_id = %request.request_id, scorer = stage.name(), "⚠️ Scorer panicked, falling back");
                }
            }
        }
        RuleBasedScorer::compute(features)
    }
}
