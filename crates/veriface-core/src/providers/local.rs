use std::sync::Arc;

use async_trait::async_trait;
use veriface_config::{MatcherSettings, ProviderKind, TieBreak};

use super::{CandidateSet, ProviderAdapter, ProviderClient, ProviderError, ProviderInput, ProviderOutcome};
use crate::errors::AppError;
use crate::faces::extractor::FaceEmbeddingBackend;
use crate::faces::matcher::find_best_match;

/// On-device extractor plus matcher. Inference runs on the blocking pool;
/// if the deadline fires first the result is simply never read.
#[derive(Clone)]
pub struct LocalMatcherAdapter {
    id: String,
    backend: ProviderClient<Arc<dyn FaceEmbeddingBackend>>,
    similarity_threshold: f64,
    tie_break: TieBreak,
}

impl std::fmt::Debug for LocalMatcherAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMatcherAdapter")
            .field("id", &self.id)
            .field("ready", &self.backend.is_ready())
            .field("similarity_threshold", &self.similarity_threshold)
            .field("tie_break", &self.tie_break)
            .finish()
    }
}

impl LocalMatcherAdapter {
    pub fn new(
        id: impl Into<String>,
        backend: ProviderClient<Arc<dyn FaceEmbeddingBackend>>,
        matcher: &MatcherSettings,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            similarity_threshold: matcher.similarity_threshold,
            tie_break: matcher.tie_break,
        }
    }
}

fn provider_error(err: AppError) -> ProviderError {
    match err {
        AppError::AmbiguousFace { .. } => ProviderError::AmbiguousFace,
        other => ProviderError::Internal(other.to_string()),
    }
}

#[async_trait]
impl ProviderAdapter for LocalMatcherAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn evaluate(
        &self,
        input: &ProviderInput,
        pool: &CandidateSet,
    ) -> Result<ProviderOutcome, ProviderError> {
        let backend = Arc::clone(self.backend.get()?);
        let frame = Arc::clone(&input.frame);
        let precomputed = input.embedding.clone();
        let pool = Arc::clone(pool);
        let threshold = input
            .similarity_threshold
            .unwrap_or(self.similarity_threshold);
        let tie_break = self.tie_break;

        let task = tokio::task::spawn_blocking(move || -> Result<ProviderOutcome, ProviderError> {
            let query = match precomputed {
                Some(embedding) => embedding,
                None => {
                    let region = backend
                        .detect(&frame)
                        .map_err(provider_error)?
                        .ok_or(ProviderError::NoFaceDetected)?;
                    backend
                        .extract_embedding(&frame, &region)
                        .map_err(provider_error)?
                }
            };

            // Report the best similarity even when it misses the threshold.
            let best = find_best_match(&query, &pool, f64::NEG_INFINITY, tie_break);
            Ok(match best {
                Some(candidate) => ProviderOutcome {
                    confidence: candidate.similarity,
                    matched_subject_id: (candidate.similarity >= threshold)
                        .then_some(candidate.subject_id),
                },
                None => ProviderOutcome {
                    confidence: 0.0,
                    matched_subject_id: None,
                },
            })
        });

        task.await
            .map_err(|err| ProviderError::Internal(format!("local matcher task failed: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::RgbImage;

    use crate::errors::AppResult;
    use crate::faces::embedding::{BoundingBox, FaceEmbedding, FaceLandmarks, FaceRegion};
    use crate::faces::store::EnrolledTemplate;

    struct FixedBackend {
        face: bool,
        embedding: Vec<f32>,
    }

    impl FaceEmbeddingBackend for FixedBackend {
        fn detect(&self, _image: &RgbImage) -> AppResult<Option<FaceRegion>> {
            Ok(self.face.then_some(FaceRegion {
                bounding_box: BoundingBox {
                    left: 0.0,
                    top: 0.0,
                    right: 1.0,
                    bottom: 1.0,
                },
                score: 0.9,
                landmarks: FaceLandmarks::default(),
            }))
        }

        fn extract_embedding(
            &self,
            _image: &RgbImage,
            _region: &FaceRegion,
        ) -> AppResult<FaceEmbedding> {
            FaceEmbedding::from_raw(self.embedding.clone())
        }
    }

    fn adapter(face: bool) -> LocalMatcherAdapter {
        let backend: Arc<dyn FaceEmbeddingBackend> = Arc::new(FixedBackend {
            face,
            embedding: vec![1.0, 0.0, 0.0],
        });
        LocalMatcherAdapter::new(
            "local",
            ProviderClient::Ready(backend),
            &veriface_config::ResolvedConfig::default().matcher,
        )
    }

    fn pool() -> CandidateSet {
        let template = |subject: &str, values: Vec<f32>| EnrolledTemplate {
            subject_id: subject.into(),
            embedding: FaceEmbedding::from_raw(values).unwrap(),
            captured_at: Utc::now(),
            raw_image_ref: None,
        };
        Arc::from(vec![
            template("alice", vec![0.95, 0.05, 0.0]),
            template("bob", vec![0.0, 1.0, 0.0]),
        ])
    }

    fn input() -> ProviderInput {
        ProviderInput {
            frame: Arc::new(RgbImage::new(4, 4)),
            embedding: None,
            similarity_threshold: None,
        }
    }

    #[tokio::test]
    async fn matches_best_candidate() {
        let outcome = adapter(true).evaluate(&input(), &pool()).await.unwrap();
        assert_eq!(outcome.matched_subject_id.as_deref(), Some("alice"));
        assert!(outcome.confidence > 99.0);
    }

    #[tokio::test]
    async fn stricter_threshold_keeps_confidence_but_drops_subject() {
        let strict = input().with_similarity_threshold(Some(100.0));
        let outcome = adapter(true).evaluate(&strict, &pool()).await.unwrap();
        assert!(outcome.matched_subject_id.is_none());
        assert!(outcome.confidence > 99.0);
    }

    #[tokio::test]
    async fn no_face_is_typed_failure() {
        let err = adapter(false).evaluate(&input(), &pool()).await.unwrap_err();
        assert_eq!(err, ProviderError::NoFaceDetected);
    }

    #[tokio::test]
    async fn precomputed_embedding_skips_detection() {
        let mut with_embedding = input();
        with_embedding.embedding = Some(FaceEmbedding::from_raw(vec![0.0, 1.0, 0.0]).unwrap());
        let outcome = adapter(false)
            .evaluate(&with_embedding, &pool())
            .await
            .unwrap();
        assert_eq!(outcome.matched_subject_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn missing_backend_is_not_configured() {
        let adapter = LocalMatcherAdapter::new(
            "local",
            ProviderClient::not_configured("detector model missing"),
            &veriface_config::ResolvedConfig::default().matcher,
        );
        let err = adapter.evaluate(&input(), &pool()).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}
