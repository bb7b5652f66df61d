//! faceprint-core: face quality scoring, embedding and matching.
//!
//! Consumes detection snapshots from an upstream detector, scores capture
//! quality, and turns face crops into 512-d unit-norm embeddings. Embeddings
//! come from an ONNX Runtime engine when one is available, otherwise from a
//! deterministic fallback so the pipeline never stalls on missing models.

pub mod embedding;
pub mod inference;
pub mod matcher;
pub mod preprocess;
pub mod quality;
pub mod snapshot;
pub mod types;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use embedding::{EmbeddingGenerator, GenerationError, FALLBACK_MODEL_VERSION};
pub use inference::{EngineError, EngineStatus, InferenceEngine, LazyEngine, ModelKind, OnnxEngine};
pub use matcher::{MatchResult, Matcher, SimilarityMatcher, DEFAULT_MATCH_THRESHOLD};
pub use quality::{FaceQualityAnalysis, GateDecision, QualityAnalyzer, QualityGate};
pub use snapshot::{BoundingBox, CaptureStep, FaceDetectionSnapshot, HeadRotation, LandmarkKind, Point};
pub use types::{Embedding, ImageStats, ShapeMismatch, EMBEDDING_DIM};
pub use validator::{ModelCheck, ModelValidationReport, ModelValidator, ValidatorConfig};
