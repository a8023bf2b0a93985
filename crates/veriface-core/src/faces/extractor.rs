use std::env;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use veriface_config::ModelSettings;

use crate::capture::load_rgb_image;
use crate::errors::{AppError, AppResult};
use crate::faces::detection::{
    crop_with_margin, decode_candidates, detector_tensor, embedder_tensor, map_to_original,
    select_region, Letterbox, StrideOutput, DETECTOR_STRIDES,
};
use crate::faces::embedding::{FaceEmbedding, FaceRegion};

const DETECTOR_ENV: &str = "VERIFACE_DETECTOR_MODEL";
const EMBEDDER_ENV: &str = "VERIFACE_EMBEDDER_MODEL";
const INTRA_THREADS: usize = 2;

/// Face detection plus identity embedding. Implementations must be usable
/// from the blocking pool, hence `Send + Sync`.
pub trait FaceEmbeddingBackend: Send + Sync {
    /// Returns `Ok(None)` when no region clears the detector confidence.
    fn detect(&self, image: &RgbImage) -> AppResult<Option<FaceRegion>>;

    fn extract_embedding(&self, image: &RgbImage, region: &FaceRegion)
        -> AppResult<FaceEmbedding>;
}

#[derive(Debug, Clone)]
pub struct FaceModelPaths {
    pub detector: PathBuf,
    pub embedder: PathBuf,
}

pub trait ModelPathResolver {
    fn resolve(&self, settings: &ModelSettings) -> AppResult<FaceModelPaths>;
}

/// Config paths win; the environment fills in whatever the config leaves out.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvModelPathResolver;

impl ModelPathResolver for EnvModelPathResolver {
    fn resolve(&self, settings: &ModelSettings) -> AppResult<FaceModelPaths> {
        let detector = settings
            .detector_model
            .clone()
            .or_else(|| env::var(DETECTOR_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "face detector",
                flag: "models.detector_model",
                env: DETECTOR_ENV,
            })?;

        let embedder = settings
            .embedder_model
            .clone()
            .or_else(|| env::var(EMBEDDER_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "face embedding network",
                flag: "models.embedder_model",
                env: EMBEDDER_ENV,
            })?;

        Ok(FaceModelPaths { detector, embedder })
    }
}

/// SCRFD detector and ArcFace-style embedder executed through ONNX Runtime.
pub struct OnnxFaceBackend {
    detector: Mutex<Session>,
    embedder: Mutex<Session>,
    settings: ModelSettings,
}

impl OnnxFaceBackend {
    pub fn new(models: &FaceModelPaths, settings: &ModelSettings) -> AppResult<Self> {
        debug!(path = %models.detector.display(), "loading detector model");
        let detector = load_session(&models.detector)?;
        debug!(path = %models.embedder.display(), "loading embedder model");
        let embedder = load_session(&models.embedder)?;

        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
            settings: settings.clone(),
        })
    }

    pub fn from_settings(settings: &ModelSettings) -> AppResult<Self> {
        let models = EnvModelPathResolver.resolve(settings)?;
        Self::new(&models, settings)
    }
}

fn load_session(path: &Path) -> AppResult<Session> {
    if !path.exists() {
        return Err(AppError::ModelLoad {
            path: path.to_path_buf(),
            message: "file does not exist".into(),
        });
    }
    Session::builder()
        .map_err(model_error(path))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(model_error(path))?
        .with_intra_threads(INTRA_THREADS)
        .map_err(model_error(path))?
        .commit_from_file(path)
        .map_err(model_error(path))
}

fn model_error<E: fmt::Display>(path: &Path) -> impl Fn(E) -> AppError + '_ {
    move |err| AppError::ModelLoad {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn inference_error<E: fmt::Display>(stage: &'static str) -> impl Fn(E) -> AppError {
    move |err| AppError::Inference {
        stage,
        message: err.to_string(),
    }
}

fn poisoned(stage: &'static str) -> AppError {
    AppError::Inference {
        stage,
        message: "session lock poisoned by an earlier panic".into(),
    }
}

impl FaceEmbeddingBackend for OnnxFaceBackend {
    fn detect(&self, image: &RgbImage) -> AppResult<Option<FaceRegion>> {
        let (width, height) = image.dimensions();
        let input_size = self.settings.detector_input_size;
        let letterbox = Letterbox::fit(width, height, input_size);
        let tensor =
            Tensor::from_array(detector_tensor(image, &letterbox)).map_err(inference_error("detector"))?;

        let mut session = self.detector.lock().map_err(|_| poisoned("detector"))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(inference_error("detector"))?;

        // Output order: scores per stride, then boxes, then optional keypoints.
        let strides = DETECTOR_STRIDES.len();
        if outputs.len() < strides * 2 {
            return Err(AppError::Inference {
                stage: "detector",
                message: format!(
                    "expected at least {} outputs, model produced {}",
                    strides * 2,
                    outputs.len()
                ),
            });
        }
        let has_keypoints = outputs.len() >= strides * 3;

        let mut candidates = Vec::new();
        for (slot, stride) in DETECTOR_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[slot]
                .try_extract_tensor::<f32>()
                .map_err(inference_error("detector"))?;
            let (_, boxes) = outputs[slot + strides]
                .try_extract_tensor::<f32>()
                .map_err(inference_error("detector"))?;
            let keypoints = if has_keypoints {
                let (_, kps) = outputs[slot + strides * 2]
                    .try_extract_tensor::<f32>()
                    .map_err(inference_error("detector"))?;
                Some(kps)
            } else {
                None
            };
            let stride_output = StrideOutput {
                stride: *stride,
                scores,
                boxes,
                keypoints,
            };
            candidates.extend(decode_candidates(
                &[stride_output],
                input_size,
                self.settings.min_detector_confidence,
            )?);
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mapped: Vec<FaceRegion> = candidates
            .iter()
            .map(|candidate| map_to_original(candidate, &letterbox, width, height))
            .filter(|region| region.bounding_box.area() > 0.0)
            .collect();
        debug!(candidates = mapped.len(), "detector pass complete");

        select_region(
            &mapped,
            self.settings.multi_face_policy,
            self.settings.ambiguity_ratio,
            width,
            height,
        )
    }

    fn extract_embedding(
        &self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> AppResult<FaceEmbedding> {
        let crop = crop_with_margin(image, &region.bounding_box)?;
        let tensor = Tensor::from_array(embedder_tensor(&crop, self.settings.embedder_input_size))
            .map_err(inference_error("embedder"))?;

        let mut session = self.embedder.lock().map_err(|_| poisoned("embedder"))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(inference_error("embedder"))?;
        if outputs.len() == 0 {
            return Err(AppError::Inference {
                stage: "embedder",
                message: "model produced no outputs".into(),
            });
        }
        let (_, values) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(inference_error("embedder"))?;

        FaceEmbedding::from_raw(values.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct FaceExtractionConfig {
    pub image: PathBuf,
    pub output: Option<PathBuf>,
}

impl FaceExtractionConfig {
    fn default_output_path(&self) -> PathBuf {
        let filename = format!(
            "face-features-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );
        PathBuf::from("captures").join("features").join(filename)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceExtractionSummary {
    pub success: bool,
    pub image_path: String,
    pub output_path: String,
    pub face: Option<FaceRegion>,
    pub embedding: Option<FaceEmbedding>,
    pub embedding_len: usize,
    pub detector_model: String,
    pub embedder_model: String,
}

#[derive(Debug)]
pub struct FaceExtractionOutcome {
    pub summary: FaceExtractionSummary,
    pub logs: Vec<String>,
}

pub fn run_face_extraction(
    config: &FaceExtractionConfig,
    settings: &ModelSettings,
) -> AppResult<FaceExtractionOutcome> {
    let models = EnvModelPathResolver.resolve(settings)?;
    let backend = OnnxFaceBackend::new(&models, settings)?;
    run_face_extraction_with_backend(config, &models, &backend)
}

pub fn run_face_extraction_with_backend<B: FaceEmbeddingBackend + ?Sized>(
    config: &FaceExtractionConfig,
    models: &FaceModelPaths,
    backend: &B,
) -> AppResult<FaceExtractionOutcome> {
    let mut logs = Vec::new();

    let rgb = load_rgb_image(&config.image)?;
    logs.push(format!(
        "Loaded image {} ({}x{})",
        config.image.display(),
        rgb.width(),
        rgb.height()
    ));

    let face = backend.detect(&rgb)?;
    let embedding = match &face {
        Some(region) => {
            logs.push(format!(
                "Detected face at ({:.0},{:.0})-({:.0},{:.0}) score {:.3}",
                region.bounding_box.left,
                region.bounding_box.top,
                region.bounding_box.right,
                region.bounding_box.bottom,
                region.score
            ));
            let embedding = backend.extract_embedding(&rgb, region)?;
            logs.push(format!("Embedding vector length: {}", embedding.dim()));
            Some(embedding)
        }
        None => {
            logs.push("No face cleared the detector confidence".into());
            None
        }
    };

    let output_path = config
        .output
        .clone()
        .unwrap_or_else(|| config.default_output_path());

    let summary = FaceExtractionSummary {
        success: embedding.is_some(),
        image_path: config.image.display().to_string(),
        output_path: output_path.display().to_string(),
        face,
        embedding_len: embedding.as_ref().map(FaceEmbedding::dim).unwrap_or(0),
        embedding,
        detector_model: models.detector.display().to_string(),
        embedder_model: models.embedder.display().to_string(),
    };

    persist_summary(&summary, &output_path)?;
    logs.push(format!("Saved embedding data to {}", output_path.display()));
    info!(output = %output_path.display(), success = summary.success, "feature extraction finished");

    Ok(FaceExtractionOutcome { summary, logs })
}

fn persist_summary(summary: &FaceExtractionSummary, output_path: &Path) -> AppResult<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|err| AppError::StoreWrite {
            path: parent.to_path_buf(),
            source: err,
        })?;
    }

    let file = File::create(output_path).map_err(|err| AppError::StoreWrite {
        path: output_path.to_path_buf(),
        source: err,
    })?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &summary)?;
    writer.flush().map_err(|err| AppError::StoreWrite {
        path: output_path.to_path_buf(),
        source: err,
    })?;

    Ok(())
}

pub fn load_summary(path: &Path) -> AppResult<FaceExtractionSummary> {
    let file = File::open(path).map_err(|source| AppError::StoreRead {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let summary: FaceExtractionSummary = serde_json::from_reader(reader)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::embedding::{BoundingBox, FaceLandmarks};
    use serde_json::Value;
    use tempfile::TempDir;

    struct StubBackend {
        region: Option<FaceRegion>,
    }

    impl FaceEmbeddingBackend for StubBackend {
        fn detect(&self, _image: &RgbImage) -> AppResult<Option<FaceRegion>> {
            Ok(self.region)
        }

        fn extract_embedding(
            &self,
            _image: &RgbImage,
            _region: &FaceRegion,
        ) -> AppResult<FaceEmbedding> {
            FaceEmbedding::from_raw(vec![0.5, 0.5, 0.5, 0.5])
        }
    }

    fn stub_models() -> FaceModelPaths {
        FaceModelPaths {
            detector: PathBuf::from("det_10g.onnx"),
            embedder: PathBuf::from("w600k_r50.onnx"),
        }
    }

    fn stub_region() -> FaceRegion {
        FaceRegion {
            bounding_box: BoundingBox {
                left: 1.0,
                top: 1.0,
                right: 6.0,
                bottom: 6.0,
            },
            score: 0.92,
            landmarks: FaceLandmarks::default(),
        }
    }

    fn write_image(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("frame.png");
        RgbImage::new(8, 8).save(&path).unwrap();
        path
    }

    #[test]
    fn extraction_writes_summary_with_embedding() {
        let tmp = TempDir::new().unwrap();
        let image = write_image(&tmp);
        let output = tmp.path().join("nested/output.json");
        let config = FaceExtractionConfig {
            image,
            output: Some(output.clone()),
        };
        let backend = StubBackend {
            region: Some(stub_region()),
        };

        let outcome = run_face_extraction_with_backend(&config, &stub_models(), &backend).unwrap();
        assert!(outcome.summary.success);
        assert_eq!(outcome.summary.embedding_len, 4);

        let written = std::fs::read_to_string(&output).unwrap();
        let json: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(json["embedding_len"], 4);
        assert!(json["embedding"].is_string());

        let loaded = load_summary(&output).unwrap();
        assert_eq!(loaded.embedding, outcome.summary.embedding);
    }

    #[test]
    fn no_face_is_reported_not_raised() {
        let tmp = TempDir::new().unwrap();
        let image = write_image(&tmp);
        let config = FaceExtractionConfig {
            image,
            output: Some(tmp.path().join("out.json")),
        };
        let backend = StubBackend { region: None };

        let outcome = run_face_extraction_with_backend(&config, &stub_models(), &backend).unwrap();
        assert!(!outcome.summary.success);
        assert!(outcome.summary.embedding.is_none());
    }

    #[test]
    fn missing_input_image_returns_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing.png");
        let config = FaceExtractionConfig {
            image: missing.clone(),
            output: None,
        };
        let backend = StubBackend { region: None };

        let err = run_face_extraction_with_backend(&config, &stub_models(), &backend).unwrap_err();
        match err {
            AppError::MissingInput { path } => assert_eq!(path, missing),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn configured_model_paths_take_precedence() {
        let settings = ModelSettings {
            detector_model: Some(PathBuf::from("/models/det.onnx")),
            embedder_model: Some(PathBuf::from("/models/emb.onnx")),
            ..veriface_config::ResolvedConfig::default().models
        };
        let paths = EnvModelPathResolver.resolve(&settings).unwrap();
        assert_eq!(paths.detector, PathBuf::from("/models/det.onnx"));
        assert_eq!(paths.embedder, PathBuf::from("/models/emb.onnx"));
    }

    #[test]
    fn missing_model_file_is_a_load_error() {
        let err = load_session(Path::new("/nonexistent/model.onnx")).unwrap_err();
        assert!(matches!(err, AppError::ModelLoad { .. }));
    }
}
