//! Passive liveness: involuntary blink, head motion and detection quality.

use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;
use veriface_config::LivenessSettings;

use crate::errors::{AppError, AppResult};
use crate::faces::embedding::{FaceLandmarks, FaceRegion};
use crate::faces::extractor::FaceEmbeddingBackend;

/// Nose sits a little below the eye-to-mouth midpoint on a level face.
const NEUTRAL_PITCH_RATIO: f64 = 0.55;
const MOTION_SHARE: f64 = 0.6;

/// Per-frame signals. Pose is in degrees; quality is in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameObservation {
    #[serde(default)]
    pub eye_aspect_ratio: Option<f64>,
    #[serde(default)]
    pub yaw_deg: Option<f64>,
    #[serde(default)]
    pub pitch_deg: Option<f64>,
    pub quality: f64,
}

impl FrameObservation {
    pub fn from_region(region: &FaceRegion) -> Self {
        let (yaw, pitch) = estimate_head_pose(&region.landmarks);
        Self {
            eye_aspect_ratio: None,
            yaw_deg: Some(yaw),
            pitch_deg: Some(pitch),
            quality: f64::from(region.score).clamp(0.0, 1.0),
        }
    }

    /// A frame in which no usable face was found.
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Coarse yaw and pitch from the five-point landmarks.
pub fn estimate_head_pose(landmarks: &FaceLandmarks) -> (f64, f64) {
    let eye_mid_x = f64::from(landmarks.left_eye.x + landmarks.right_eye.x) / 2.0;
    let eye_mid_y = f64::from(landmarks.left_eye.y + landmarks.right_eye.y) / 2.0;
    let mouth_mid_y = f64::from(landmarks.mouth_left.y + landmarks.mouth_right.y) / 2.0;
    let interocular = f64::from(landmarks.right_eye.x - landmarks.left_eye.x)
        .hypot(f64::from(landmarks.right_eye.y - landmarks.left_eye.y));
    let vertical = mouth_mid_y - eye_mid_y;
    if interocular <= f64::EPSILON || vertical.abs() <= f64::EPSILON {
        return (0.0, 0.0);
    }

    let yaw_ratio = (f64::from(landmarks.nose.x) - eye_mid_x) / (interocular / 2.0);
    let pitch_ratio = (f64::from(landmarks.nose.y) - eye_mid_y) / vertical - NEUTRAL_PITCH_RATIO;
    let yaw = yaw_ratio.clamp(-1.0, 1.0).asin().to_degrees();
    let pitch = (pitch_ratio * 2.0).clamp(-1.0, 1.0).asin().to_degrees();
    (yaw, pitch)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    pub score: f64,
    pub blink_detected: bool,
    pub head_pose_delta: f64,
    pub min_quality: f64,
    pub frames_analysed: usize,
}

impl LivenessVerdict {
    /// Verdict used when no signals could be derived at all.
    pub fn fail_closed() -> Self {
        Self {
            is_live: false,
            score: 0.0,
            blink_detected: false,
            head_pose_delta: 0.0,
            min_quality: 0.0,
            frames_analysed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessGate {
    settings: LivenessSettings,
}

impl LivenessGate {
    pub fn new(settings: LivenessSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LivenessSettings {
        &self.settings
    }

    pub fn evaluate(&self, observations: &[FrameObservation]) -> LivenessVerdict {
        if observations.is_empty() {
            return LivenessVerdict::fail_closed();
        }

        let blink_detected = detect_blink(
            observations,
            self.settings.blink_closed_ear,
            self.settings.blink_open_ear,
        );
        let head_pose_delta = head_pose_delta(observations);
        let min_quality = observations
            .iter()
            .map(|obs| obs.quality)
            .fold(f64::INFINITY, f64::min)
            .clamp(0.0, 1.0);

        let enough_frames = observations.len() >= self.settings.min_frames;
        let head_motion = head_pose_delta >= self.settings.min_head_pose_delta_deg;
        let quality_ok = min_quality >= self.settings.min_quality;
        let is_live = enough_frames && (blink_detected || head_motion) && quality_ok;

        let motion = if blink_detected {
            1.0
        } else if self.settings.min_head_pose_delta_deg > 0.0 {
            (head_pose_delta / self.settings.min_head_pose_delta_deg).min(1.0)
        } else {
            1.0
        };
        let score = if enough_frames {
            ((MOTION_SHARE * motion + (1.0 - MOTION_SHARE) * min_quality) * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        debug!(
            frames = observations.len(),
            blink_detected,
            head_pose_delta,
            min_quality,
            is_live,
            "liveness evaluated"
        );

        LivenessVerdict {
            is_live,
            score,
            blink_detected,
            head_pose_delta,
            min_quality,
            frames_analysed: observations.len(),
        }
    }
}

/// EAR falls below `closed` and later recovers above `open`.
fn detect_blink(observations: &[FrameObservation], closed: f64, open: f64) -> bool {
    let mut eyes_closed = false;
    for ear in observations.iter().filter_map(|obs| obs.eye_aspect_ratio) {
        if ear < closed {
            eyes_closed = true;
        } else if eyes_closed && ear > open {
            return true;
        }
    }
    false
}

fn head_pose_delta(observations: &[FrameObservation]) -> f64 {
    let range = |values: Vec<f64>| -> f64 {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if values.len() < 2 {
            0.0
        } else {
            max - min
        }
    };
    let yaw = range(observations.iter().filter_map(|obs| obs.yaw_deg).collect());
    let pitch = range(observations.iter().filter_map(|obs| obs.pitch_deg).collect());
    yaw.max(pitch)
}

/// Run detection over every frame. Frames without a single usable face
/// count as zero quality.
pub fn observe_frames(
    backend: &dyn FaceEmbeddingBackend,
    frames: &[Arc<RgbImage>],
) -> AppResult<Vec<FrameObservation>> {
    let mut observations = Vec::with_capacity(frames.len());
    for frame in frames {
        let observation = match backend.detect(frame) {
            Ok(Some(region)) => FrameObservation::from_region(&region),
            Ok(None) | Err(AppError::AmbiguousFace { .. }) => FrameObservation::missing(),
            Err(err) => return Err(err),
        };
        observations.push(observation);
    }
    Ok(observations)
}
