//! Wiring between the command line and the core library: config, store,
//! backend and cascade are assembled here once per invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use veriface_config::ResolvedConfig;
use veriface_core::capture::{load_observations, Capture, ImageFileSource};
use veriface_core::cascade::{ActionContext, Cascade, CascadeDecision};
use veriface_core::errors::{AppError, AppResult};
use veriface_core::faces::{
    run_face_enrollment_with, run_face_extraction, run_face_removal_with, CandidatePool,
    EnrolledTemplate, FaceEnrollmentConfig, FaceEnrollmentOutcome, FaceExtractionConfig,
    FaceEmbedding, FaceExtractionOutcome, FaceRemovalConfig, FaceRemovalOutcome,
    FilesystemTemplateStore, LivenessGate, OnnxFaceBackend,
};
use veriface_core::providers::{build_providers, load_backend, CandidateSet};

use crate::cli::{
    CaptureArgs, ConfirmArgs, EnrollArgs, ExtractArgs, TemplateRemoveArgs, VerifyArgs,
};
use crate::config::{load_config, open_store};

/// A verification call: plain 1:N identification, or an action
/// confirmation for a named subject.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRequest {
    pub capture: CaptureArgs,
    pub confirm: Option<ActionTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionTarget {
    pub subject_id: String,
    pub context: ActionContext,
}

impl From<&VerifyArgs> for VerificationRequest {
    fn from(args: &VerifyArgs) -> Self {
        Self {
            capture: args.capture.clone(),
            confirm: None,
        }
    }
}

impl From<&ConfirmArgs> for VerificationRequest {
    fn from(args: &ConfirmArgs) -> Self {
        Self {
            capture: args.capture.clone(),
            confirm: Some(ActionTarget {
                subject_id: args.subject.clone(),
                context: ActionContext {
                    action: args.action.clone(),
                    reference: args.reference.clone(),
                },
            }),
        }
    }
}

impl From<&ExtractArgs> for FaceExtractionConfig {
    fn from(args: &ExtractArgs) -> Self {
        Self {
            image: args.image.clone(),
            output: args.output.clone(),
        }
    }
}

/// One row of `templates list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateListing {
    pub subject_id: String,
    pub captured_at: String,
    pub embedding_len: usize,
    pub raw_image_ref: Option<String>,
}

impl From<&EnrolledTemplate> for TemplateListing {
    fn from(template: &EnrolledTemplate) -> Self {
        Self {
            subject_id: template.subject_id.clone(),
            captured_at: template.captured_at.to_rfc3339(),
            embedding_len: template.embedding.dim(),
            raw_image_ref: template.raw_image_ref.clone(),
        }
    }
}

pub fn run_extract(config_path: Option<&Path>, args: &ExtractArgs) -> AppResult<FaceExtractionOutcome> {
    let config = load_config(config_path)?;
    run_face_extraction(&FaceExtractionConfig::from(args), &config.models)
}

pub fn run_enroll(config_path: Option<&Path>, args: &EnrollArgs) -> AppResult<FaceEnrollmentOutcome> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let backend = OnnxFaceBackend::from_settings(&config.models)?;
    let mut source = ImageFileSource::new(args.images.iter().cloned());
    let enrollment = FaceEnrollmentConfig {
        subject_id: args.subject.clone(),
        settings: config.enrollment,
    };
    run_face_enrollment_with(&enrollment, &backend, &store, &mut source)
}

pub fn run_list_templates(config_path: Option<&Path>) -> AppResult<Vec<TemplateListing>> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    Ok(store
        .list_enrolled_templates()?
        .iter()
        .map(TemplateListing::from)
        .collect())
}

pub fn run_remove_template(
    config_path: Option<&Path>,
    args: &TemplateRemoveArgs,
) -> AppResult<FaceRemovalOutcome> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    run_face_removal_with(
        &FaceRemovalConfig {
            subject_id: args.subject.clone(),
        },
        &store,
    )
}

pub fn run_verification(
    config_path: Option<&Path>,
    request: &VerificationRequest,
) -> AppResult<CascadeDecision> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let capture = load_capture(&request.capture)?;
    let cascade = build_cascade(&config);
    let pool = load_pool(&store)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Runtime(err.to_string()))?;

    runtime.block_on(async {
        match &request.confirm {
            Some(target) => {
                cascade
                    .confirm_action(&target.subject_id, &capture, pool, &target.context)
                    .await
            }
            None => cascade.verify_face(&capture, pool).await,
        }
    })
}

/// Decode the frames and attach whatever signals the client computed itself.
pub fn load_capture(args: &CaptureArgs) -> AppResult<Capture> {
    let mut capture = Capture::from_paths(&args.frames)?;
    if let Some(path) = &args.observations {
        let observations = load_observations(path)?;
        if observations.len() != capture.frames().len() {
            warn!(
                frames = capture.frames().len(),
                observations = observations.len(),
                "observation count differs from frame count"
            );
        }
        capture = capture.with_observations(observations);
    }
    if let Some(encoded) = &args.embedding {
        capture = capture.with_embedding(FaceEmbedding::from_encoded(encoded.trim())?);
    }
    Ok(capture)
}

fn build_cascade(config: &ResolvedConfig) -> Cascade {
    let backend = load_backend(&config.models);
    let providers = build_providers(config, &backend);
    info!(
        providers = providers.len(),
        local_backend = backend.is_ready(),
        "cascade assembled"
    );
    Cascade::new(providers, LivenessGate::new(config.liveness), config)
        .with_liveness_backend(backend.ready())
}

fn load_pool(store: &FilesystemTemplateStore) -> AppResult<CandidateSet> {
    let templates = store.list_enrolled_templates()?;
    debug!(count = templates.len(), "candidate pool loaded");
    Ok(Arc::from(templates))
}
