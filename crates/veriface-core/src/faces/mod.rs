pub mod detection;
pub mod embedding;
pub mod enrollment;
pub mod extractor;
pub mod liveness;
pub mod matcher;
pub mod store;

pub use embedding::{BoundingBox, FaceEmbedding, FaceLandmarks, FaceRegion, Point};

pub use enrollment::{
    run_face_enrollment_with, run_face_removal_with, validate_subject_id, FaceEnrollmentConfig,
    FaceEnrollmentOutcome, FaceRemovalConfig, FaceRemovalOutcome,
};

pub use extractor::{
    load_summary, run_face_extraction, run_face_extraction_with_backend, EnvModelPathResolver,
    FaceEmbeddingBackend, FaceExtractionConfig, FaceExtractionOutcome, FaceExtractionSummary,
    FaceModelPaths, ModelPathResolver, OnnxFaceBackend,
};

pub use liveness::{observe_frames, FrameObservation, LivenessGate, LivenessVerdict};

pub use matcher::{aggregate, find_best_match, similarity, MatchCandidate};

pub use store::{
    CandidatePool, EnrolledTemplate, EnvStoreDirResolver, FilesystemTemplateStore,
    StoreDirResolver, TemplateStore,
};
