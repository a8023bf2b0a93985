use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/veriface/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/veriface/config.toml";
pub const DEFAULT_STORE_DIR: &str = "/var/lib/veriface/templates";

pub const DEFAULT_DETECTOR_INPUT_SIZE: u32 = 640;
pub const DEFAULT_EMBEDDER_INPUT_SIZE: u32 = 112;
pub const DEFAULT_MIN_DETECTOR_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_AMBIGUITY_RATIO: f32 = 0.85;
/// Coarsest detector stride; the letterboxed canvas must tile evenly.
pub const DETECTOR_INPUT_ALIGNMENT: u32 = 32;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 70.0;

pub const DEFAULT_LIVENESS_MIN_FRAMES: usize = 3;
pub const DEFAULT_BLINK_CLOSED_EAR: f64 = 0.21;
pub const DEFAULT_BLINK_OPEN_EAR: f64 = 0.26;
pub const DEFAULT_MIN_HEAD_POSE_DELTA_DEG: f64 = 8.0;
pub const DEFAULT_MIN_LIVENESS_QUALITY: f64 = 0.6;

pub const DEFAULT_MIN_COMBINED_SCORE: f64 = 75.0;
pub const DEFAULT_MIN_SUCCESSFUL_PROVIDERS: usize = 2;
pub const DEFAULT_GLOBAL_DEADLINE_MILLIS: u64 = 1500;
pub const DEFAULT_DEADLINE_HEADROOM_MILLIS: u64 = 200;

pub const DEFAULT_ACTION_MIN_COMBINED_SCORE: f64 = 85.0;

pub const DEFAULT_REQUIRED_CAPTURES: usize = 5;
pub const DEFAULT_MAX_CAPTURE_ATTEMPTS: usize = 15;

pub const DEFAULT_PROVIDER_TIMEOUT_MILLIS: u64 = 1000;
pub const DEFAULT_PROVIDER_WEIGHT: f64 = 1.0;

/// What the detector does when more than one strong face is in frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultiFacePolicy {
    #[default]
    Reject,
    Largest,
    MostCentral,
    HighestScore,
}

/// Rule applied when two candidates tie on similarity or vote weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    #[default]
    Lexicographic,
    FirstEncountered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Local,
    HttpCompare,
    HttpLiveness,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::HttpCompare => "http-compare",
            ProviderKind::HttpLiveness => "http-liveness",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    pub store_dir: Option<PathBuf>,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub matcher: MatcherSection,
    #[serde(default)]
    pub liveness: LivenessSection,
    #[serde(default)]
    pub cascade: CascadeSection,
    #[serde(default)]
    pub action: ActionSection,
    #[serde(default)]
    pub enrollment: EnrollmentSection,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelsSection {
    pub detector_model: Option<PathBuf>,
    pub embedder_model: Option<PathBuf>,
    pub detector_input_size: Option<u32>,
    pub embedder_input_size: Option<u32>,
    pub min_detector_confidence: Option<f32>,
    pub multi_face_policy: Option<MultiFacePolicy>,
    pub ambiguity_ratio: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MatcherSection {
    pub similarity_threshold: Option<f64>,
    pub tie_break: Option<TieBreak>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LivenessSection {
    pub min_frames: Option<usize>,
    pub blink_closed_ear: Option<f64>,
    pub blink_open_ear: Option<f64>,
    pub min_head_pose_delta_deg: Option<f64>,
    pub min_quality: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CascadeSection {
    pub min_combined_score: Option<f64>,
    pub min_successful_providers: Option<usize>,
    pub global_deadline_ms: Option<u64>,
    pub deadline_headroom_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ActionSection {
    pub min_combined_score: Option<f64>,
    pub min_successful_providers: Option<usize>,
    pub similarity_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnrollmentSection {
    pub required_captures: Option<usize>,
    pub max_attempts: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub kind: ProviderKind,
    pub weight: Option<f64>,
    pub vote_weight: Option<f64>,
    pub timeout_ms: Option<u64>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub detector_model: Option<PathBuf>,
    pub embedder_model: Option<PathBuf>,
    pub detector_input_size: u32,
    pub embedder_input_size: u32,
    pub min_detector_confidence: f32,
    pub multi_face_policy: MultiFacePolicy,
    pub ambiguity_ratio: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherSettings {
    pub similarity_threshold: f64,
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessSettings {
    pub min_frames: usize,
    pub blink_closed_ear: f64,
    pub blink_open_ear: f64,
    pub min_head_pose_delta_deg: f64,
    pub min_quality: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSettings {
    pub min_combined_score: f64,
    pub min_successful_providers: usize,
    pub global_deadline: Duration,
    pub deadline_headroom: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionSettings {
    pub min_combined_score: f64,
    pub min_successful_providers: usize,
    pub similarity_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentSettings {
    pub required_captures: usize,
    pub max_attempts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub id: String,
    pub kind: ProviderKind,
    pub weight: f64,
    pub vote_weight: f64,
    pub timeout: Duration,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// Store directory from the config file. The store falls back to
    /// `$VERIFACE_STORE_DIR`, then [`DEFAULT_STORE_DIR`].
    pub store_dir: Option<PathBuf>,
    pub models: ModelSettings,
    pub matcher: MatcherSettings,
    pub liveness: LivenessSettings,
    pub cascade: CascadeSettings,
    pub action: ActionSettings,
    pub enrollment: EnrollmentSettings,
    pub providers: Vec<ProviderSettings>,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        let models = ModelSettings {
            detector_model: raw.models.detector_model,
            embedder_model: raw.models.embedder_model,
            detector_input_size: raw
                .models
                .detector_input_size
                .unwrap_or(DEFAULT_DETECTOR_INPUT_SIZE),
            embedder_input_size: raw
                .models
                .embedder_input_size
                .unwrap_or(DEFAULT_EMBEDDER_INPUT_SIZE),
            min_detector_confidence: raw
                .models
                .min_detector_confidence
                .unwrap_or(DEFAULT_MIN_DETECTOR_CONFIDENCE),
            multi_face_policy: raw.models.multi_face_policy.unwrap_or_default(),
            ambiguity_ratio: raw
                .models
                .ambiguity_ratio
                .unwrap_or(DEFAULT_AMBIGUITY_RATIO),
        };

        let matcher = MatcherSettings {
            similarity_threshold: raw
                .matcher
                .similarity_threshold
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            tie_break: raw.matcher.tie_break.unwrap_or_default(),
        };

        let liveness = LivenessSettings {
            min_frames: raw
                .liveness
                .min_frames
                .unwrap_or(DEFAULT_LIVENESS_MIN_FRAMES)
                .max(2),
            blink_closed_ear: raw
                .liveness
                .blink_closed_ear
                .unwrap_or(DEFAULT_BLINK_CLOSED_EAR),
            blink_open_ear: raw
                .liveness
                .blink_open_ear
                .unwrap_or(DEFAULT_BLINK_OPEN_EAR),
            min_head_pose_delta_deg: raw
                .liveness
                .min_head_pose_delta_deg
                .unwrap_or(DEFAULT_MIN_HEAD_POSE_DELTA_DEG),
            min_quality: raw
                .liveness
                .min_quality
                .unwrap_or(DEFAULT_MIN_LIVENESS_QUALITY),
        };

        let cascade = CascadeSettings {
            min_combined_score: raw
                .cascade
                .min_combined_score
                .unwrap_or(DEFAULT_MIN_COMBINED_SCORE),
            min_successful_providers: raw
                .cascade
                .min_successful_providers
                .unwrap_or(DEFAULT_MIN_SUCCESSFUL_PROVIDERS),
            global_deadline: Duration::from_millis(
                raw.cascade
                    .global_deadline_ms
                    .unwrap_or(DEFAULT_GLOBAL_DEADLINE_MILLIS),
            ),
            deadline_headroom: Duration::from_millis(
                raw.cascade
                    .deadline_headroom_ms
                    .unwrap_or(DEFAULT_DEADLINE_HEADROOM_MILLIS),
            ),
        };

        let action = ActionSettings {
            min_combined_score: raw
                .action
                .min_combined_score
                .unwrap_or(DEFAULT_ACTION_MIN_COMBINED_SCORE),
            min_successful_providers: raw
                .action
                .min_successful_providers
                .unwrap_or(cascade.min_successful_providers),
            similarity_threshold: raw
                .action
                .similarity_threshold
                .unwrap_or(matcher.similarity_threshold),
        };

        let enrollment = EnrollmentSettings {
            required_captures: raw
                .enrollment
                .required_captures
                .unwrap_or(DEFAULT_REQUIRED_CAPTURES)
                .max(1),
            max_attempts: raw
                .enrollment
                .max_attempts
                .unwrap_or(DEFAULT_MAX_CAPTURE_ATTEMPTS),
        };

        let mut providers: Vec<ProviderSettings> = raw
            .providers
            .into_iter()
            .filter(|entry| entry.enabled.unwrap_or(true))
            .map(|entry| {
                let weight = entry.weight.unwrap_or(DEFAULT_PROVIDER_WEIGHT);
                ProviderSettings {
                    id: entry.id,
                    kind: entry.kind,
                    weight,
                    vote_weight: entry.vote_weight.unwrap_or(weight),
                    timeout: Duration::from_millis(
                        entry.timeout_ms.unwrap_or(DEFAULT_PROVIDER_TIMEOUT_MILLIS),
                    ),
                    endpoint: entry.endpoint,
                    api_key_env: entry.api_key_env,
                }
            })
            .collect();
        if providers.is_empty() {
            providers.push(default_local_provider());
        }

        Self {
            store_dir: raw.store_dir,
            models,
            matcher,
            liveness,
            cascade,
            action,
            enrollment,
            providers,
        }
    }

    /// Largest per-provider timeout; the global deadline must exceed it by the headroom.
    pub fn max_provider_timeout(&self) -> Duration {
        self.providers
            .iter()
            .map(|provider| provider.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = self.max_provider_timeout() + self.cascade.deadline_headroom;
        if self.cascade.global_deadline < required {
            return Err(ConfigError::Invalid {
                message: format!(
                    "cascade.global_deadline_ms ({}) must be at least the largest provider timeout plus headroom ({})",
                    self.cascade.global_deadline.as_millis(),
                    required.as_millis()
                ),
            });
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: "provider id cannot be empty".into(),
                });
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate provider id '{}'", provider.id),
                });
            }
            if !provider.weight.is_finite() || provider.weight < 0.0 {
                return Err(ConfigError::Invalid {
                    message: format!("provider '{}' has an invalid weight", provider.id),
                });
            }
            if !provider.vote_weight.is_finite() || provider.vote_weight < 0.0 {
                return Err(ConfigError::Invalid {
                    message: format!("provider '{}' has an invalid vote_weight", provider.id),
                });
            }
        }

        let models = &self.models;
        if models.detector_input_size == 0
            || models.detector_input_size % DETECTOR_INPUT_ALIGNMENT != 0
        {
            return Err(ConfigError::Invalid {
                message: format!(
                    "models.detector_input_size ({}) must be a non-zero multiple of {DETECTOR_INPUT_ALIGNMENT}",
                    models.detector_input_size
                ),
            });
        }
        if models.embedder_input_size == 0 {
            return Err(ConfigError::Invalid {
                message: "models.embedder_input_size must be greater than zero".into(),
            });
        }
        if !(0.0..=1.0).contains(&models.min_detector_confidence) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "models.min_detector_confidence ({}) must lie in [0, 1]",
                    models.min_detector_confidence
                ),
            });
        }
        if !(models.ambiguity_ratio > 0.0 && models.ambiguity_ratio <= 1.0) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "models.ambiguity_ratio ({}) must lie in (0, 1]",
                    models.ambiguity_ratio
                ),
            });
        }

        if self.liveness.blink_open_ear <= self.liveness.blink_closed_ear {
            return Err(ConfigError::Invalid {
                message: "liveness.blink_open_ear must be greater than blink_closed_ear".into(),
            });
        }

        Ok(())
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

fn default_local_provider() -> ProviderSettings {
    ProviderSettings {
        id: "local".into(),
        kind: ProviderKind::Local,
        weight: DEFAULT_PROVIDER_WEIGHT,
        vote_weight: DEFAULT_PROVIDER_WEIGHT,
        timeout: Duration::from_millis(DEFAULT_PROVIDER_TIMEOUT_MILLIS),
        endpoint: None,
        api_key_env: None,
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

fn default_sources() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_config() -> Result<Option<LoadedConfig>, ConfigError> {
    load_from_paths(&default_sources())
}

/// Resolve configuration from `explicit` when given (which must exist), otherwise
/// from the standard search paths.
pub fn load_resolved_config(
    explicit: Option<&Path>,
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match explicit {
        Some(path) => {
            let contents = read_config_file(path)?;
            finish(Some(LoadedConfig::new(contents, path.to_path_buf())))
        }
        None => load_resolved_from_paths(&default_sources()),
    }
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed = parse_config(path, &contents)?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    finish(load_from_paths(paths)?)
}

fn finish(loaded: Option<LoadedConfig>) -> Result<ResolvedConfigWithSource, ConfigError> {
    let with_source = match loaded {
        Some(entry) => ResolvedConfigWithSource {
            resolved: ResolvedConfig::from_raw(entry.contents),
            source: Some(entry.source),
        },
        None => ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        },
    };
    with_source.resolved.validate()?;
    Ok(with_source)
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(path, &contents)
}

fn parse_config(path: &Path, contents: &str) -> Result<ConfigFile, ConfigError> {
    toml::from_str::<ConfigFile>(contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
