//! faceprint-service: enrollment and verification API.
//!
//! Wires the quality gate, embedding generator, matcher, store and model
//! validator into one explicitly constructed [`FaceprintService`]. Inference
//! runs on a dedicated thread and every call to it is bounded by a timeout;
//! a timed-out or failed call falls back to the deterministic strategy.

pub mod config;
pub mod service;
pub mod worker;

pub use config::{ConfigError, ServiceConfig};
pub use service::{CaptureResult, FaceprintService, ServiceStatus};
pub use worker::{WorkerError, WorkerHandle};

use faceprint_core::embedding::GenerationError;
use faceprint_core::types::ShapeMismatch;
use faceprint_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("capture rejected by quality gate (overall {overall:.2}): {}", .issues.join("; "))]
    QualityRejected {
        overall: f32,
        issues: Vec<String>,
        recommendations: Vec<String>,
    },
    #[error(
        "reference for '{identity}' was produced by {} but the candidate by {}; re-enroll to compare",
        .reference.as_deref().unwrap_or("an unknown model"),
        .candidate.as_deref().unwrap_or("an unknown model")
    )]
    ModelMismatch {
        identity: String,
        reference: Option<String>,
        candidate: Option<String>,
    },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl ServiceError {
    /// No embedding is enrolled for the identity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::NotFound(_)))
    }

    /// The stored embedding failed its digest check.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::Integrity(_)))
    }

    /// Reference and candidate come from different embedding models.
    pub fn is_model_mismatch(&self) -> bool {
        matches!(self, ServiceError::ModelMismatch { .. })
    }
}
