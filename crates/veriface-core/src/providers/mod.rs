//! Verification engines behind one bounded contract.
//!
//! Every engine implements [`ProviderAdapter`]. The cascade never calls an
//! adapter directly: it goes through [`BoundedProvider::verify`], which races
//! the call against its deadline and folds timeouts, errors and panics into a
//! failure [`ProviderResult`]. Nothing an adapter does can abort its peers.

pub mod factory;
pub mod http;
pub mod http_compare;
pub mod http_liveness;
pub mod local;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use image::RgbImage;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use veriface_config::{ProviderKind, ProviderSettings};

use crate::capture::Capture;
use crate::faces::embedding::FaceEmbedding;
use crate::faces::store::EnrolledTemplate;

pub use factory::{build_providers, load_backend, BackendHandle};
pub use http::HttpEngineClient;
pub use http_compare::HttpCompareAdapter;
pub use http_liveness::HttpLivenessAdapter;
pub use local::LocalMatcherAdapter;

/// Read-only candidate pool shared by every adapter during one call.
pub type CandidateSet = Arc<[EnrolledTemplate]>;

/// What each adapter receives: the identification frame, plus an optional
/// precomputed embedding and a per-call similarity threshold override.
#[derive(Debug, Clone)]
pub struct ProviderInput {
    pub frame: Arc<RgbImage>,
    pub embedding: Option<FaceEmbedding>,
    pub similarity_threshold: Option<f64>,
}

impl ProviderInput {
    pub fn from_capture(capture: &Capture) -> Self {
        Self {
            frame: capture.primary_frame(),
            embedding: capture.embedding().cloned(),
            similarity_threshold: None,
        }
    }

    pub fn with_similarity_threshold(mut self, threshold: Option<f64>) -> Self {
        self.similarity_threshold = threshold;
        self
    }
}

/// A completed evaluation. Completing without a match is still a success.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutcome {
    pub confidence: f64,
    pub matched_subject_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("provider timed out after {0} ms")]
    Timeout(u64),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces of similar strength in frame")]
    AmbiguousFace,
    #[error("engine could not reach a confident result: {0}")]
    InsufficientConfidence(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid engine response: {0}")]
    InvalidResponse(String),
    #[error("internal provider error: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured(_) => "not-configured",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::NoFaceDetected => "no-face-detected",
            ProviderError::AmbiguousFace => "ambiguous-face",
            ProviderError::InsufficientConfidence(_) => "insufficient-confidence",
            ProviderError::Transport(_) => "transport",
            ProviderError::InvalidResponse(_) => "invalid-response",
            ProviderError::Internal(_) => "internal",
        }
    }
}

impl Serialize for ProviderError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ProviderError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderResult {
    pub provider_id: String,
    pub success: bool,
    pub confidence: f64,
    pub matched_subject_id: Option<String>,
    pub elapsed_ms: u64,
    pub error: Option<ProviderError>,
}

impl ProviderResult {
    pub fn succeeded(provider_id: &str, outcome: ProviderOutcome, elapsed_ms: u64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            success: true,
            confidence: outcome.confidence,
            matched_subject_id: outcome.matched_subject_id,
            elapsed_ms,
            error: None,
        }
    }

    pub fn failed(provider_id: &str, error: ProviderError, elapsed_ms: u64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            success: false,
            confidence: 0.0,
            matched_subject_id: None,
            elapsed_ms,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn evaluate(
        &self,
        input: &ProviderInput,
        pool: &CandidateSet,
    ) -> Result<ProviderOutcome, ProviderError>;
}

/// Client handle created at startup. A missing endpoint, credential or
/// model is a state, not an error raised later.
#[derive(Debug, Clone)]
pub enum ProviderClient<T> {
    Ready(T),
    NotConfigured { reason: String },
}

impl<T> ProviderClient<T> {
    pub fn not_configured(reason: impl Into<String>) -> Self {
        ProviderClient::NotConfigured {
            reason: reason.into(),
        }
    }

    pub fn get(&self) -> Result<&T, ProviderError> {
        match self {
            ProviderClient::Ready(client) => Ok(client),
            ProviderClient::NotConfigured { reason } => {
                Err(ProviderError::NotConfigured(reason.clone()))
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ProviderClient::Ready(_))
    }
}

/// An adapter with its time bound and trust weights.
#[derive(Clone)]
pub struct BoundedProvider {
    adapter: Arc<dyn ProviderAdapter>,
    timeout: Duration,
    weight: f64,
    vote_weight: f64,
}

impl std::fmt::Debug for BoundedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedProvider")
            .field("id", &self.adapter.id())
            .field("kind", &self.adapter.kind())
            .field("timeout", &self.timeout)
            .field("weight", &self.weight)
            .field("vote_weight", &self.vote_weight)
            .finish()
    }
}

impl BoundedProvider {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        timeout: Duration,
        weight: f64,
        vote_weight: f64,
    ) -> Self {
        Self {
            adapter,
            timeout,
            weight,
            vote_weight,
        }
    }

    pub fn from_settings(adapter: Arc<dyn ProviderAdapter>, settings: &ProviderSettings) -> Self {
        Self::new(
            adapter,
            settings.timeout,
            settings.weight,
            settings.vote_weight,
        )
    }

    pub fn id(&self) -> &str {
        self.adapter.id()
    }

    pub fn kind(&self) -> ProviderKind {
        self.adapter.kind()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn vote_weight(&self) -> f64 {
        self.vote_weight
    }

    /// Run the adapter until `min(own timeout, global_deadline)`.
    ///
    /// Always yields a result; a late async call is dropped, which cancels
    /// its pending I/O.
    pub async fn verify(
        &self,
        input: &ProviderInput,
        pool: &CandidateSet,
        global_deadline: Instant,
    ) -> ProviderResult {
        let started = Instant::now();
        let deadline = (started + self.timeout).min(global_deadline);
        let call = AssertUnwindSafe(self.adapter.evaluate(input, pool)).catch_unwind();

        let outcome = match timeout_at(deadline, call).await {
            Ok(Ok(result)) => result.and_then(validate_outcome),
            Ok(Err(panic)) => Err(ProviderError::Internal(panic_message(panic))),
            Err(_) => Err(ProviderError::Timeout(
                deadline.saturating_duration_since(started).as_millis() as u64,
            )),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(outcome) => {
                debug!(
                    provider = self.id(),
                    elapsed_ms,
                    confidence = outcome.confidence,
                    subject = outcome.matched_subject_id.as_deref().unwrap_or("-"),
                    "provider settled"
                );
                ProviderResult::succeeded(self.id(), outcome, elapsed_ms)
            }
            Err(error) => {
                warn!(
                    provider = self.id(),
                    elapsed_ms,
                    kind = error.kind(),
                    error = %error,
                    "provider failed"
                );
                ProviderResult::failed(self.id(), error, elapsed_ms)
            }
        }
    }
}

fn validate_outcome(outcome: ProviderOutcome) -> Result<ProviderOutcome, ProviderError> {
    if !outcome.confidence.is_finite() || !(0.0..=100.0).contains(&outcome.confidence) {
        return Err(ProviderError::InvalidResponse(format!(
            "confidence {} outside 0..=100",
            outcome.confidence
        )));
    }
    Ok(outcome)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("adapter panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("adapter panicked: {message}")
    } else {
        "adapter panicked".to_string()
    }
}
