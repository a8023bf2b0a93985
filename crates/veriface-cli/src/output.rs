use std::error::Error;
use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;
use veriface_core::cascade::CascadeDecision;
use veriface_core::errors::{AppError, AppResult};
use veriface_core::faces::{FaceEnrollmentOutcome, FaceExtractionOutcome, FaceRemovalOutcome};

use crate::cli::OutputMode;
use crate::engine::TemplateListing;

fn write_json<T: Serialize + ?Sized>(payload: &T) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let payload = serde_json::to_string(payload)?;
    handle.write_all(payload.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn render_extract(outcome: &FaceExtractionOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for line in &outcome.logs {
                println!("{line}");
            }
            if outcome.summary.success {
                println!(
                    "Feature extraction successful: {} (embedding length {})",
                    outcome.summary.output_path, outcome.summary.embedding_len
                );
            } else {
                println!(
                    "No face found in {}; summary written to {}",
                    outcome.summary.image_path, outcome.summary.output_path
                );
            }
        }
        OutputMode::Json => write_json(&outcome.summary)?,
    }
    Ok(())
}

pub fn render_enroll(outcome: &FaceEnrollmentOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for line in &outcome.logs {
                println!("{line}");
            }
            println!(
                "Enrollment successful: subject {} from {} capture(s), {} discarded",
                outcome.subject_id, outcome.captures_used, outcome.discarded
            );
        }
        OutputMode::Json => write_json(&json!({
            "subject_id": outcome.subject_id,
            "captures_used": outcome.captures_used,
            "attempts": outcome.attempts,
            "discarded": outcome.discarded,
            "captured_at": outcome.template.captured_at.to_rfc3339(),
            "raw_image_ref": outcome.template.raw_image_ref,
        }))?,
    }
    Ok(())
}

pub fn render_decision(decision: &CascadeDecision, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for result in &decision.per_provider_results {
                match &result.error {
                    None => println!(
                        "  {:<16} {:>5.1}  {:<16} {} ms",
                        result.provider_id,
                        result.confidence,
                        result.matched_subject_id.as_deref().unwrap_or("-"),
                        result.elapsed_ms
                    ),
                    Some(error) => println!(
                        "  {:<16} failed ({}): {} [{} ms]",
                        result.provider_id,
                        error.kind(),
                        error,
                        result.elapsed_ms
                    ),
                }
            }
            println!(
                "  liveness         {} (score {:.1}, blink {}, head delta {:.1} deg)",
                if decision.liveness_verdict.is_live {
                    "live"
                } else {
                    "not live"
                },
                decision.liveness_verdict.score,
                decision.liveness_verdict.blink_detected,
                decision.liveness_verdict.head_pose_delta
            );
            match (&decision.matched_subject_id, decision.success) {
                (Some(subject), true) => println!(
                    "Verified {subject} (combined score {:.1}, {} ms)",
                    decision.combined_score, decision.total_elapsed_ms
                ),
                _ => println!(
                    "Rejected: {} (combined score {:.1}, {} ms)",
                    decision.reason.describe(),
                    decision.combined_score,
                    decision.total_elapsed_ms
                ),
            }
        }
        OutputMode::Json => write_json(decision)?,
    }
    Ok(())
}

pub fn render_templates(templates: &[TemplateListing], mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if templates.is_empty() {
                println!("No templates enrolled");
            }
            for template in templates {
                println!(
                    "{:<24} {}  dim={}  image={}",
                    template.subject_id,
                    template.captured_at,
                    template.embedding_len,
                    template.raw_image_ref.as_deref().unwrap_or("-")
                );
            }
        }
        OutputMode::Json => write_json(templates)?,
    }
    Ok(())
}

pub fn render_remove(outcome: &FaceRemovalOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for line in &outcome.logs {
                println!("{line}");
            }
        }
        OutputMode::Json => write_json(&json!({
            "subject_id": outcome.subject_id,
            "removed": outcome.removed,
        }))?,
    }
    Ok(())
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "success": false,
                "error": err.human_message(),
            });
            eprintln!("{payload}");
        }
    }
}
