//! Capture inputs: decoded frames, client-side observations and frame sources.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::faces::embedding::FaceEmbedding;
use crate::faces::liveness::FrameObservation;

const JPEG_QUALITY: u8 = 90;

/// A verification capture: an ordered frame sequence from one session.
///
/// The first frame is the one sent to identity providers; the whole
/// sequence feeds the liveness gate. Clients that run their own face mesh
/// may attach per-frame observations and a precomputed query embedding.
#[derive(Debug, Clone)]
pub struct Capture {
    frames: Vec<Arc<RgbImage>>,
    observations: Option<Vec<FrameObservation>>,
    embedding: Option<FaceEmbedding>,
}

impl Capture {
    pub fn new(frames: Vec<RgbImage>) -> AppResult<Self> {
        if frames.is_empty() {
            return Err(AppError::EmptyCapture);
        }
        Ok(Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            observations: None,
            embedding: None,
        })
    }

    pub fn from_paths(paths: &[PathBuf]) -> AppResult<Self> {
        let frames = paths
            .iter()
            .map(|path| load_rgb_image(path))
            .collect::<AppResult<Vec<_>>>()?;
        debug!(frames = frames.len(), "loaded capture from disk");
        Self::new(frames)
    }

    pub fn with_observations(mut self, observations: Vec<FrameObservation>) -> Self {
        self.observations = Some(observations);
        self
    }

    pub fn with_embedding(mut self, embedding: FaceEmbedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn frames(&self) -> &[Arc<RgbImage>] {
        &self.frames
    }

    pub fn primary_frame(&self) -> Arc<RgbImage> {
        // `new` guarantees at least one frame.
        Arc::clone(&self.frames[0])
    }

    pub fn observations(&self) -> Option<&[FrameObservation]> {
        self.observations.as_deref()
    }

    pub fn embedding(&self) -> Option<&FaceEmbedding> {
        self.embedding.as_ref()
    }
}

pub fn load_rgb_image(path: &Path) -> AppResult<RgbImage> {
    if !path.exists() {
        return Err(AppError::MissingInput {
            path: path.to_path_buf(),
        });
    }
    let image = image::open(path).map_err(|source| AppError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.to_rgb8())
}

/// Per-frame liveness observations produced by a client-side face mesh,
/// stored as a JSON array with one entry per frame.
pub fn load_observations(path: &Path) -> AppResult<Vec<FrameObservation>> {
    let data = fs::read(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => AppError::MissingInput {
            path: path.to_path_buf(),
        },
        _ => AppError::Io(err),
    })?;
    let observations: Vec<FrameObservation> =
        serde_json::from_slice(&data).map_err(|err| AppError::InvalidObservations {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    if let Some(frame) = observations
        .iter()
        .position(|obs| !obs.quality.is_finite() || !(0.0..=1.0).contains(&obs.quality))
    {
        return Err(AppError::InvalidObservations {
            path: path.to_path_buf(),
            message: format!("frame {frame} has quality outside [0, 1]"),
        });
    }
    debug!(path = %path.display(), frames = observations.len(), "loaded liveness observations");
    Ok(observations)
}

pub fn encode_jpeg(image: &RgbImage) -> AppResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    image
        .write_with_encoder(encoder)
        .map_err(AppError::ImageEncode)?;
    Ok(buffer.into_inner())
}

/// Sequential frames for enrollment. `Ok(None)` means the source is exhausted.
pub trait FrameSource {
    fn next_frame(&mut self) -> AppResult<Option<RgbImage>>;
}

/// Frames read from image files in the given order.
#[derive(Debug, Clone)]
pub struct ImageFileSource {
    paths: VecDeque<PathBuf>,
}

impl ImageFileSource {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageFileSource {
    fn next_frame(&mut self) -> AppResult<Option<RgbImage>> {
        match self.paths.pop_front() {
            Some(path) => load_rgb_image(&path).map(Some),
            None => Ok(None),
        }
    }
}
