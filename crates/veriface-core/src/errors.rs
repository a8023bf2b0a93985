use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use image::ImageError;
use thiserror::Error;
use veriface_config::ConfigError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("input file not found or unreadable: {path}")]
    MissingInput { path: PathBuf },

    #[error("failed to decode image {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("failed to encode image: {0}")]
    ImageEncode(#[source] ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("missing {kind} model; provide {flag} or set ${env}")]
    MissingModel {
        kind: &'static str,
        flag: &'static str,
        env: &'static str,
    },

    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("inference failed in {stage}: {message}")]
    Inference {
        stage: &'static str,
        message: String,
    },

    #[error("multiple faces of similar strength detected ({count} candidates)")]
    AmbiguousFace { count: usize },

    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("capture contains no frames")]
    EmptyCapture,

    #[error("observation file {path} is invalid: {message}")]
    InvalidObservations { path: PathBuf, message: String },

    #[error("enrollment for {subject} collected {collected} of {required} captures after {attempts} attempt(s)")]
    InsufficientCaptures {
        subject: String,
        collected: usize,
        required: usize,
        attempts: usize,
    },

    #[error("invalid subject id '{subject}': {message}")]
    InvalidSubject { subject: String, message: String },

    #[error("no enrolled template for subject {subject}")]
    UnknownSubject { subject: String },

    #[error("failed to write {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    StoreRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("template file {path} is invalid: {message}")]
    InvalidTemplateFile { path: PathBuf, message: String },

    #[error("template store {path} is encrypted and requires a key")]
    EncryptedStoreRequiresKey { path: PathBuf },

    #[error("template encryption error: {0}")]
    Encryption(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("async runtime error: {0}")]
    Runtime(String),
}

impl AppError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AppError::MissingInput { .. } => ExitCode::from(2),
            AppError::ImageDecode { .. } => ExitCode::from(2),
            AppError::MissingModel { .. } => ExitCode::from(2),
            AppError::ModelLoad { .. } => ExitCode::from(2),
            AppError::InvalidEmbedding(_) => ExitCode::from(3),
            AppError::AmbiguousFace { .. } => ExitCode::from(3),
            AppError::EmptyCapture => ExitCode::from(2),
            AppError::InvalidObservations { .. } => ExitCode::from(2),
            AppError::InsufficientCaptures { .. } => ExitCode::from(3),
            AppError::InvalidSubject { .. } => ExitCode::from(2),
            AppError::UnknownSubject { .. } => ExitCode::from(4),
            AppError::InvalidTemplateFile { .. } => ExitCode::from(2),
            AppError::EncryptedStoreRequiresKey { .. } => ExitCode::from(2),
            AppError::Encryption(_) => ExitCode::from(2),
            AppError::Config(_) => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;
