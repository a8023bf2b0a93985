use serde::Serialize;
use veriface_config::TieBreak;

use crate::errors::{AppError, AppResult};
use crate::faces::embedding::FaceEmbedding;
use crate::faces::store::EnrolledTemplate;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub subject_id: String,
    pub similarity: f64,
}

/// Dot product of two unit vectors mapped onto 0–100.
///
/// Mismatched dimensions cannot be compared and score 0.
pub fn similarity(lhs: &FaceEmbedding, rhs: &FaceEmbedding) -> f64 {
    if lhs.dim() != rhs.dim() {
        return 0.0;
    }
    let dot: f64 = lhs
        .as_slice()
        .iter()
        .zip(rhs.as_slice())
        .map(|(l, r)| f64::from(*l) * f64::from(*r))
        .sum();
    ((dot + 1.0) * 50.0).clamp(0.0, 100.0)
}

/// Highest-similarity template clearing `threshold` (inclusive).
pub fn find_best_match(
    query: &FaceEmbedding,
    pool: &[EnrolledTemplate],
    threshold: f64,
    tie_break: TieBreak,
) -> Option<MatchCandidate> {
    let mut best: Option<MatchCandidate> = None;

    for template in pool {
        let score = similarity(query, &template.embedding);
        let replace = match &best {
            None => true,
            Some(current) if score > current.similarity => true,
            Some(current) if score == current.similarity => match tie_break {
                TieBreak::Lexicographic => template.subject_id < current.subject_id,
                TieBreak::FirstEncountered => false,
            },
            Some(_) => false,
        };
        if replace {
            best = Some(MatchCandidate {
                subject_id: template.subject_id.clone(),
                similarity: score,
            });
        }
    }

    best.filter(|candidate| candidate.similarity >= threshold)
}

/// Element-wise mean of `embeddings`, re-normalized to unit length.
pub fn aggregate(embeddings: &[FaceEmbedding]) -> AppResult<FaceEmbedding> {
    let first = embeddings.first().ok_or_else(|| {
        AppError::InvalidEmbedding("cannot aggregate an empty set of embeddings".into())
    })?;
    let dim = first.dim();

    let mut sums = vec![0.0f64; dim];
    for (index, embedding) in embeddings.iter().enumerate() {
        if embedding.dim() != dim {
            return Err(AppError::InvalidEmbedding(format!(
                "embedding length mismatch at capture {} (expected {}, found {})",
                index,
                dim,
                embedding.dim()
            )));
        }
        for (sum, value) in sums.iter_mut().zip(embedding.as_slice()) {
            *sum += f64::from(*value);
        }
    }

    let count = embeddings.len() as f64;
    FaceEmbedding::from_raw(sums.into_iter().map(|sum| (sum / count) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn embedding(values: &[f32]) -> FaceEmbedding {
        FaceEmbedding::from_raw(values.to_vec()).unwrap()
    }

    fn template(subject: &str, values: &[f32]) -> EnrolledTemplate {
        EnrolledTemplate {
            subject_id: subject.into(),
            embedding: embedding(values),
            captured_at: Utc::now(),
            raw_image_ref: None,
        }
    }

    fn random_embedding(rng: &mut StdRng, dim: usize) -> FaceEmbedding {
        let values = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        FaceEmbedding::from_raw(values).unwrap()
    }

    #[test]
    fn self_similarity_is_full_scale() {
        let mut rng = StdRng::seed_from_u64(7);
        let template = random_embedding(&mut rng, 512);
        assert!((similarity(&template, &template) - 100.0).abs() < 1e-3);
    }

    #[test]
    fn opposite_vectors_score_zero() {
        let a = embedding(&[1.0, 0.0]);
        let b = embedding(&[-1.0, 0.0]);
        assert!(similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn random_embeddings_fall_below_threshold() {
        let mut rng = StdRng::seed_from_u64(42);
        let threshold = veriface_config::DEFAULT_SIMILARITY_THRESHOLD;
        let mut below = 0;
        for _ in 0..200 {
            let a = random_embedding(&mut rng, 512);
            let b = random_embedding(&mut rng, 512);
            if similarity(&a, &b) < threshold {
                below += 1;
            }
        }
        assert!(below >= 198, "only {below}/200 random pairs scored below threshold");
    }

    #[test]
    fn best_match_requires_threshold_inclusive() {
        let query = embedding(&[1.0, 0.0]);
        let pool = vec![template("alice", &[0.0, 1.0])];
        // orthogonal vectors sit exactly at 50
        let at_threshold = find_best_match(&query, &pool, 50.0, TieBreak::Lexicographic);
        assert_eq!(at_threshold.map(|m| m.subject_id), Some("alice".into()));
        assert!(find_best_match(&query, &pool, 50.001, TieBreak::Lexicographic).is_none());
    }

    #[test]
    fn best_match_picks_highest_similarity() {
        let query = embedding(&[1.0, 0.0, 0.0]);
        let pool = vec![
            template("bob", &[0.0, 1.0, 0.0]),
            template("carol", &[0.9, 0.1, 0.0]),
            template("dave", &[-1.0, 0.0, 0.0]),
        ];
        let best = find_best_match(&query, &pool, 70.0, TieBreak::Lexicographic).unwrap();
        assert_eq!(best.subject_id, "carol");
    }

    #[test]
    fn ties_follow_configured_rule() {
        let query = embedding(&[1.0, 0.0]);
        let pool = vec![template("zed", &[1.0, 0.0]), template("amy", &[1.0, 0.0])];

        let lexicographic = find_best_match(&query, &pool, 0.0, TieBreak::Lexicographic).unwrap();
        assert_eq!(lexicographic.subject_id, "amy");

        let first = find_best_match(&query, &pool, 0.0, TieBreak::FirstEncountered).unwrap();
        assert_eq!(first.subject_id, "zed");
    }

    #[test]
    fn empty_pool_has_no_match() {
        let query = embedding(&[1.0]);
        assert!(find_best_match(&query, &[], 0.0, TieBreak::Lexicographic).is_none());
    }

    #[test]
    fn aggregating_identical_embeddings_is_idempotent() {
        let single = embedding(&[0.2, -0.4, 0.8, 0.1]);
        let copies = vec![single.clone(); 5];
        let merged = aggregate(&copies).unwrap();
        for (a, b) in merged.as_slice().iter().zip(single.as_slice()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn aggregate_renormalizes_the_mean() {
        let merged = aggregate(&[embedding(&[1.0, 0.0]), embedding(&[0.0, 1.0])]).unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((merged.as_slice()[0] - expected).abs() < 1e-6);
        assert!((merged.as_slice()[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn aggregate_rejects_empty_and_mismatched_input() {
        assert!(matches!(
            aggregate(&[]).unwrap_err(),
            AppError::InvalidEmbedding(_)
        ));
        let err = aggregate(&[embedding(&[1.0, 0.0]), embedding(&[1.0, 0.0, 0.0])]).unwrap_err();
        assert!(matches!(err, AppError::InvalidEmbedding(_)));
    }
}
