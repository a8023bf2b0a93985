use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info};
use veriface_config::EnrollmentSettings;

use crate::capture::FrameSource;
use crate::errors::{AppError, AppResult};
use crate::faces::embedding::FaceEmbedding;
use crate::faces::extractor::FaceEmbeddingBackend;
use crate::faces::matcher::aggregate;
use crate::faces::store::{EnrolledTemplate, TemplateStore};

#[derive(Debug, Clone)]
pub struct FaceEnrollmentConfig {
    pub subject_id: String,
    pub settings: EnrollmentSettings,
}

#[derive(Debug, Clone)]
pub struct FaceRemovalConfig {
    pub subject_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceEnrollmentOutcome {
    pub subject_id: String,
    pub template: EnrolledTemplate,
    pub captures_used: usize,
    pub attempts: usize,
    pub discarded: usize,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceRemovalOutcome {
    pub subject_id: String,
    pub removed: bool,
    pub logs: Vec<String>,
}

/// Collect `required_captures` detected faces from `source`, aggregate them
/// and persist the template with the best-scoring frame as its raw image.
///
/// Frames without a usable face are discarded and do not count toward the
/// target. The pipeline gives up after `max_attempts` frames.
pub fn run_face_enrollment_with<B, S, F>(
    config: &FaceEnrollmentConfig,
    backend: &B,
    store: &S,
    source: &mut F,
) -> AppResult<FaceEnrollmentOutcome>
where
    B: FaceEmbeddingBackend + ?Sized,
    S: TemplateStore + ?Sized,
    F: FrameSource + ?Sized,
{
    validate_subject_id(&config.subject_id)?;

    let required = config.settings.required_captures;
    let max_attempts = config.settings.max_attempts.max(required);
    let mut logs = Vec::new();
    let mut embeddings: Vec<FaceEmbedding> = Vec::with_capacity(required);
    let mut representative: Option<(f32, RgbImage)> = None;
    let mut attempts = 0;
    let mut discarded = 0;

    while embeddings.len() < required && attempts < max_attempts {
        let Some(frame) = source.next_frame()? else {
            logs.push("Frame source exhausted".into());
            break;
        };
        attempts += 1;

        let reason = match backend.detect(&frame) {
            Ok(Some(region)) => match backend.extract_embedding(&frame, &region) {
                Ok(embedding) => {
                    embeddings.push(embedding);
                    logs.push(format!(
                        "Capture {} accepted (score {:.3}, {}/{})",
                        attempts,
                        region.score,
                        embeddings.len(),
                        required
                    ));
                    let better = representative
                        .as_ref()
                        .map_or(true, |(best, _)| region.score > *best);
                    if better {
                        representative = Some((region.score, frame));
                    }
                    continue;
                }
                Err(AppError::InvalidEmbedding(message)) => message,
                Err(err) => return Err(err),
            },
            Ok(None) => "no face cleared the detector confidence".to_string(),
            Err(AppError::AmbiguousFace { count }) => {
                format!("{count} faces of similar strength in frame")
            }
            Err(err) => return Err(err),
        };
        discarded += 1;
        debug!(subject = %config.subject_id, attempt = attempts, %reason, "capture discarded");
        logs.push(format!("Capture {attempts} discarded: {reason}"));
    }

    let (_, raw_image) = match representative {
        Some(best) if embeddings.len() >= required => best,
        _ => {
            return Err(AppError::InsufficientCaptures {
                subject: config.subject_id.clone(),
                collected: embeddings.len(),
                required,
                attempts,
            })
        }
    };

    let template_embedding = aggregate(&embeddings)?;
    let raw_image_ref = store.save_raw_image(&config.subject_id, &raw_image)?;
    let template =
        store.save_template(&config.subject_id, &template_embedding, Some(&raw_image_ref))?;

    logs.push(format!(
        "Enrolled subject {} from {} capture(s)",
        config.subject_id,
        embeddings.len()
    ));
    info!(
        subject = %config.subject_id,
        captures = embeddings.len(),
        attempts,
        discarded,
        "enrollment complete"
    );

    Ok(FaceEnrollmentOutcome {
        subject_id: config.subject_id.clone(),
        template,
        captures_used: embeddings.len(),
        attempts,
        discarded,
        logs,
    })
}

pub fn run_face_removal_with<S>(
    config: &FaceRemovalConfig,
    store: &S,
) -> AppResult<FaceRemovalOutcome>
where
    S: TemplateStore + ?Sized,
{
    validate_subject_id(&config.subject_id)?;
    let removed = store.remove_template(&config.subject_id)?;
    let message = if removed {
        format!("Removed template for subject {}", config.subject_id)
    } else {
        format!("No template enrolled for subject {}", config.subject_id)
    };
    info!(subject = %config.subject_id, removed, "template removal");
    Ok(FaceRemovalOutcome {
        subject_id: config.subject_id.clone(),
        removed,
        logs: vec![message],
    })
}

pub fn validate_subject_id(subject: &str) -> AppResult<()> {
    if subject.is_empty() {
        return Err(AppError::InvalidSubject {
            subject: subject.to_string(),
            message: "subject id cannot be empty".into(),
        });
    }

    if !subject
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(AppError::InvalidSubject {
            subject: subject.to_string(),
            message: "use ASCII letters, numbers, '-' or '_' only".into(),
        });
    }

    Ok(())
}
