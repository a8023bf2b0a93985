//! Pure fusion of provider results. No I/O, no clock.

use std::collections::HashMap;

use veriface_config::TieBreak;

use crate::providers::ProviderResult;

/// Per-provider weight keyed by provider id.
pub type ProviderWeights = HashMap<String, f64>;

const VOTE_EPSILON: f64 = 1e-9;

/// Weighted mean confidence over successful results.
///
/// Failed results and providers without a positive weight are left out of
/// both the numerator and the denominator. Returns 0 when nothing is left.
/// Contributions are summed in provider-id order so the value does not
/// depend on the order of `results`.
pub fn combined_score(results: &[ProviderResult], weights: &ProviderWeights) -> f64 {
    let mut contributions: Vec<(&str, f64, f64)> = results
        .iter()
        .filter(|result| result.success)
        .filter_map(|result| {
            let weight = weights.get(&result.provider_id).copied().unwrap_or(0.0);
            (weight > 0.0 && weight.is_finite())
                .then_some((result.provider_id.as_str(), weight, result.confidence))
        })
        .collect();
    contributions.sort_by(|a, b| a.0.cmp(b.0));

    let total_weight: f64 = contributions.iter().map(|(_, weight, _)| weight).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = contributions
        .iter()
        .map(|(_, weight, confidence)| weight * confidence.clamp(0.0, 100.0))
        .sum();
    (weighted / total_weight).clamp(0.0, 100.0)
}

/// Weighted vote among successful results that name a subject.
///
/// Equal totals follow `tie_break`: the smallest subject id, or whichever
/// subject appeared first in `results`.
pub fn consensus(
    results: &[ProviderResult],
    vote_weights: &ProviderWeights,
    tie_break: TieBreak,
) -> Option<String> {
    let mut tally: Vec<(&str, f64)> = Vec::new();
    for result in results.iter().filter(|result| result.success) {
        let Some(subject) = result.matched_subject_id.as_deref() else {
            continue;
        };
        let weight = vote_weights.get(&result.provider_id).copied().unwrap_or(0.0);
        if weight <= 0.0 || !weight.is_finite() {
            continue;
        }
        match tally.iter_mut().find(|(candidate, _)| *candidate == subject) {
            Some((_, total)) => *total += weight,
            None => tally.push((subject, weight)),
        }
    }

    let mut winner: Option<(&str, f64)> = None;
    for (subject, total) in tally {
        winner = match winner {
            None => Some((subject, total)),
            Some((_, best)) if total > best + VOTE_EPSILON => Some((subject, total)),
            Some((current, best)) if (total - best).abs() <= VOTE_EPSILON => match tie_break {
                TieBreak::Lexicographic if subject < current => Some((subject, total)),
                _ => Some((current, best)),
            },
            keep => keep,
        };
    }
    winner.map(|(subject, _)| subject.to_string())
}

/// Count of results that completed without error.
pub fn successful_count(results: &[ProviderResult]) -> usize {
    results.iter().filter(|result| result.success).count()
}
