//! Cascade orchestration: fan out to every provider, fuse, decide.

pub mod decision;
pub mod scoring;

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use veriface_config::{ActionSettings, CascadeSettings, ResolvedConfig, TieBreak};

use crate::capture::Capture;
use crate::errors::{AppError, AppResult};
use crate::faces::enrollment::validate_subject_id;
use crate::faces::extractor::FaceEmbeddingBackend;
use crate::faces::liveness::{observe_frames, LivenessGate, LivenessVerdict};
use crate::providers::{BoundedProvider, CandidateSet, ProviderInput};

pub use decision::{decide, round_to_tenth, CascadeDecision, DecisionPolicy, DecisionReason};
pub use scoring::{combined_score, consensus, successful_count, ProviderWeights};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStage {
    Idle,
    Dispatched,
    AwaitingAll,
    Settled,
    Scored,
    Decided,
}

/// The high-value action being re-authenticated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionContext {
    pub action: String,
    pub reference: Option<String>,
}

struct StageTracker {
    stage: CascadeStage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            stage: CascadeStage::Idle,
        }
    }

    fn advance(&mut self, next: CascadeStage) {
        debug!(from = ?self.stage, to = ?next, "cascade stage");
        self.stage = next;
    }
}

pub struct Cascade {
    providers: Vec<BoundedProvider>,
    liveness: LivenessGate,
    liveness_backend: Option<Arc<dyn FaceEmbeddingBackend>>,
    settings: CascadeSettings,
    action: ActionSettings,
    tie_break: TieBreak,
}

impl Cascade {
    pub fn new(
        providers: Vec<BoundedProvider>,
        liveness: LivenessGate,
        config: &ResolvedConfig,
    ) -> Self {
        Self {
            providers,
            liveness,
            liveness_backend: None,
            settings: config.cascade.clone(),
            action: config.action.clone(),
            tie_break: config.matcher.tie_break,
        }
    }

    /// Backend used to derive liveness observations when the capture
    /// carries none.
    pub fn with_liveness_backend(mut self, backend: Option<Arc<dyn FaceEmbeddingBackend>>) -> Self {
        self.liveness_backend = backend;
        self
    }

    pub fn providers(&self) -> &[BoundedProvider] {
        &self.providers
    }

    /// 1:N authentication against `pool`.
    pub async fn verify_face(
        &self,
        capture: &Capture,
        pool: CandidateSet,
    ) -> AppResult<CascadeDecision> {
        let policy = DecisionPolicy {
            min_combined_score: self.settings.min_combined_score,
            min_successful_providers: self.settings.min_successful_providers,
        };
        let decision = self
            .run(ProviderInput::from_capture(capture), capture, pool, policy)
            .await;
        info!(
            success = decision.success,
            reason = decision.reason.as_str(),
            subject = decision.matched_subject_id.as_deref().unwrap_or("-"),
            combined_score = decision.combined_score,
            elapsed_ms = decision.total_elapsed_ms,
            "face verification decided"
        );
        Ok(decision)
    }

    /// Re-verify `subject_id` at the moment of a high-value action, under the
    /// stricter action policy and against that subject's template only.
    pub async fn confirm_action(
        &self,
        subject_id: &str,
        capture: &Capture,
        pool: CandidateSet,
        context: &ActionContext,
    ) -> AppResult<CascadeDecision> {
        validate_subject_id(subject_id)?;
        let restricted: CandidateSet = pool
            .iter()
            .filter(|template| template.subject_id == subject_id)
            .cloned()
            .collect::<Vec<_>>()
            .into();
        if restricted.is_empty() {
            return Err(AppError::UnknownSubject {
                subject: subject_id.to_string(),
            });
        }

        let policy = DecisionPolicy {
            min_combined_score: self.action.min_combined_score,
            min_successful_providers: self.action.min_successful_providers,
        };
        let input = ProviderInput::from_capture(capture)
            .with_similarity_threshold(Some(self.action.similarity_threshold));
        let mut decision = self.run(input, capture, restricted, policy).await;

        if decision.success && decision.matched_subject_id.as_deref() != Some(subject_id) {
            decision.success = false;
            decision.matched_subject_id = None;
            decision.reason = DecisionReason::NoConsensusMatch;
        }

        info!(
            subject = subject_id,
            action = %context.action,
            reference = context.reference.as_deref().unwrap_or("-"),
            success = decision.success,
            reason = decision.reason.as_str(),
            combined_score = decision.combined_score,
            elapsed_ms = decision.total_elapsed_ms,
            "action confirmation decided"
        );
        Ok(decision)
    }

    async fn run(
        &self,
        input: ProviderInput,
        capture: &Capture,
        pool: CandidateSet,
        policy: DecisionPolicy,
    ) -> CascadeDecision {
        let started = Instant::now();
        let global_deadline = started + self.settings.global_deadline;
        let mut tracker = StageTracker::new();

        let calls = join_all(
            self.providers
                .iter()
                .map(|provider| provider.verify(&input, &pool, global_deadline)),
        );
        tracker.advance(CascadeStage::Dispatched);
        tracker.advance(CascadeStage::AwaitingAll);
        let (results, liveness) = tokio::join!(calls, self.evaluate_liveness(capture, global_deadline));
        tracker.advance(CascadeStage::Settled);

        // join_all keeps provider order, so `results` lines up with configuration.
        let mut weights = ProviderWeights::new();
        let mut vote_weights = ProviderWeights::new();
        for provider in &self.providers {
            weights.insert(provider.id().to_string(), provider.weight());
            vote_weights.insert(provider.id().to_string(), provider.vote_weight());
        }
        // Thresholds see the unrounded mean; only the reported value is rounded.
        let score = combined_score(&results, &weights);
        let successful = successful_count(&results);
        let winner = consensus(&results, &vote_weights, self.tie_break);
        tracker.advance(CascadeStage::Scored);

        let reason = decide(&liveness, score, successful, winner.as_deref(), &policy);
        let success = reason == DecisionReason::Success;
        tracker.advance(CascadeStage::Decided);

        CascadeDecision {
            success,
            matched_subject_id: if success { winner } else { None },
            combined_score: round_to_tenth(score),
            per_provider_results: results,
            liveness_verdict: liveness,
            reason,
            total_elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn evaluate_liveness(&self, capture: &Capture, deadline: Instant) -> LivenessVerdict {
        if let Some(observations) = capture.observations() {
            return self.liveness.evaluate(observations);
        }
        let Some(backend) = self.liveness_backend.clone() else {
            warn!("no liveness observations and no backend; failing closed");
            return LivenessVerdict::fail_closed();
        };

        let frames = capture.frames().to_vec();
        let task = tokio::task::spawn_blocking(move || observe_frames(backend.as_ref(), &frames));
        match timeout_at(deadline, task).await {
            Ok(Ok(Ok(observations))) => self.liveness.evaluate(&observations),
            Ok(Ok(Err(err))) => {
                warn!(error = %err, "liveness observation failed; failing closed");
                LivenessVerdict::fail_closed()
            }
            Ok(Err(err)) => {
                warn!(error = %err, "liveness task aborted; failing closed");
                LivenessVerdict::fail_closed()
            }
            Err(_) => {
                warn!("liveness observation exceeded the global deadline; failing closed");
                LivenessVerdict::fail_closed()
            }
        }
    }
}
