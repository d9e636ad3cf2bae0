//! Approval and interest rate decision for a scored request

use crate::models::{Decision, FeatureVector, ScoreResult};

pub const DEFAULT_APPROVAL_THRESHOLD: u16 = 650;

/// Maps a score and the loan valuation to the decision written on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub approval_threshold: u16,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
        }
    }
}

impl DecisionPolicy {
    pub fn new(approval_threshold: u16) -> Self {
        Self { approval_threshold }
    }

    pub fn decide(&self, score: ScoreResult, features: &FeatureVector) -> Decision {
        let bps = (features.base_interest_rate_pct * 100.0).round();
        Decision {
            score,
            approved: score.value >= self.approval_threshold,
            interest_rate_bps: bps.clamp(0.0, u32::MAX as f64) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScoreSource, ValuationSource};

    fn features(rate_pct: f64) -> FeatureVector {
        FeatureVector {
            balance_native: 0.0,
            transaction_count: 0,
            days_active: 0,
            has_social_link: false,
            loan_value_reference: 0.0,
            base_interest_rate_pct: rate_pct,
            valuation_source: ValuationSource::Live,
        }
    }

    fn score(value: u16) -> ScoreResult {
        ScoreResult {
            value,
            source: ScoreSource::RuleBased,
        }
    }

    #[test]
    fn test_approval_boundary() {
        let policy = DecisionPolicy::default();
        assert!(policy.decide(score(650), &features(12.0)).approved);
        assert!(!policy.decide(score(649), &features(12.0)).approved);
    }

    #[test]
    fn test_tier_rates_to_bps() {
        let policy = DecisionPolicy::default();
        for (pct, bps) in [(8.0, 800), (10.0, 1000), (11.0, 1100), (12.0, 1200)] {
            assert_eq!(policy.decide(score(700), &features(pct)).interest_rate_bps, bps);
        }
    }

    #[test]
    fn test_decision_carries_score() {
        let decision = DecisionPolicy::new(700).decide(score(690), &features(10.5));
        assert_eq!(decision.score.value, 690);
        assert!(!decision.approved);
        assert_eq!(decision.interest_rate_bps, 1050);
    }
}
