use std::fmt;

use serde::Serialize;

use crate::faces::liveness::LivenessVerdict;
use crate::providers::ProviderResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    SpoofDetected,
    InsufficientProviderCount,
    LowCombinedScore,
    NoConsensusMatch,
    Success,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::SpoofDetected => "spoof-detected",
            DecisionReason::InsufficientProviderCount => "insufficient-provider-count",
            DecisionReason::LowCombinedScore => "low-combined-score",
            DecisionReason::NoConsensusMatch => "no-consensus-match",
            DecisionReason::Success => "success",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            DecisionReason::SpoofDetected => "the capture did not pass the liveness check",
            DecisionReason::InsufficientProviderCount => {
                "too few verification engines returned a usable result"
            }
            DecisionReason::LowCombinedScore => "the combined confidence is below the minimum",
            DecisionReason::NoConsensusMatch => "the engines did not agree on an enrolled subject",
            DecisionReason::Success => "identity verified",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acceptance thresholds for one kind of call (login or action confirmation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    pub min_combined_score: f64,
    pub min_successful_providers: usize,
}

/// Apply the acceptance rule. Thresholds are inclusive; the first failing
/// check in priority order names the reason.
pub fn decide(
    liveness: &LivenessVerdict,
    combined_score: f64,
    successful: usize,
    consensus: Option<&str>,
    policy: &DecisionPolicy,
) -> DecisionReason {
    if !liveness.is_live {
        DecisionReason::SpoofDetected
    } else if successful < policy.min_successful_providers {
        DecisionReason::InsufficientProviderCount
    } else if combined_score < policy.min_combined_score {
        DecisionReason::LowCombinedScore
    } else if consensus.is_none() {
        DecisionReason::NoConsensusMatch
    } else {
        DecisionReason::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeDecision {
    pub success: bool,
    pub matched_subject_id: Option<String>,
    pub combined_score: f64,
    pub per_provider_results: Vec<ProviderResult>,
    pub liveness_verdict: LivenessVerdict,
    pub reason: DecisionReason,
    pub total_elapsed_ms: u64,
}

pub fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(is_live: bool) -> LivenessVerdict {
        LivenessVerdict {
            is_live,
            ..LivenessVerdict::fail_closed()
        }
    }

    const POLICY: DecisionPolicy = DecisionPolicy {
        min_combined_score: 75.0,
        min_successful_providers: 2,
    };

    #[test]
    fn spoof_outranks_everything() {
        let reason = decide(&live(false), 95.0, 3, Some("alice"), &POLICY);
        assert_eq!(reason, DecisionReason::SpoofDetected);
        let reason = decide(&live(false), 0.0, 0, None, &POLICY);
        assert_eq!(reason, DecisionReason::SpoofDetected);
    }

    #[test]
    fn provider_count_outranks_score() {
        let reason = decide(&live(true), 10.0, 1, None, &POLICY);
        assert_eq!(reason, DecisionReason::InsufficientProviderCount);
    }

    #[test]
    fn low_score_outranks_missing_consensus() {
        let reason = decide(&live(true), 74.9, 2, None, &POLICY);
        assert_eq!(reason, DecisionReason::LowCombinedScore);
        let reason = decide(&live(true), 80.0, 2, None, &POLICY);
        assert_eq!(reason, DecisionReason::NoConsensusMatch);
    }

    #[test]
    fn threshold_is_inclusive() {
        let reason = decide(&live(true), 75.0, 2, Some("alice"), &POLICY);
        assert_eq!(reason, DecisionReason::Success);
    }

    #[test]
    fn reasons_serialize_kebab_case() {
        let json = serde_json::to_string(&DecisionReason::InsufficientProviderCount).unwrap();
        assert_eq!(json, "\"insufficient-provider-count\"");
        assert_eq!(DecisionReason::SpoofDetected.to_string(), "spoof-detected");
    }

    #[test]
    fn rounding_keeps_one_decimal() {
        assert_eq!(round_to_tenth(86.04), 86.0);
        assert_eq!(round_to_tenth(86.05000001), 86.1);
    }
}
