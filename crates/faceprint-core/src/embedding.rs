//! Face embedding generation.
//!
//! Two strategies, chosen when the generator is constructed:
//! - `Engine`: the 512-d embedding model behind an [`InferenceEngine`].
//! - `Deterministic`: a pseudo-embedding seeded from the pixel data and face
//!   geometry. Always available; identical inputs give identical output on
//!   every platform and run.
//!
//! The engine strategy falls back to the deterministic one whenever the
//! engine is unavailable or returns a malformed vector.

use crate::inference::{EngineError, InferenceEngine, LazyEngine, ModelKind};
use crate::preprocess::{decode_image, prepare_face, PixelRange, PreparedFace};
use crate::snapshot::FaceDetectionSnapshot;
use crate::types::{Embedding, EMBEDDING_DIM};
use image::DynamicImage;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use std::f64::consts::PI;
use thiserror::Error;

/// Model version recorded on deterministic embeddings. Bump together with
/// [`FALLBACK_DOMAIN_TAG`] whenever the derivation below changes.
pub const FALLBACK_MODEL_VERSION: &str = "fallback-v1";
const FALLBACK_DOMAIN_TAG: &[u8] = b"faceprint-fallback-v1";

// Blend of the per-dimension terms.
const GAUSSIAN_WEIGHT: f64 = 0.7;
const TENSOR_WEIGHT: f64 = 0.2;
const GEOMETRY_WEIGHT: f64 = 0.05;
const POSITION_WEIGHT: f64 = 0.05;
const TENSOR_CLIP: f64 = 3.0;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("image decode failed: {0}")]
    DecodeFailed(String),
    #[error("face region lies outside the image")]
    EmptyCrop,
    #[error("generated vector has zero or non-finite norm")]
    Degenerate,
}

/// How embeddings are produced.
pub enum EmbeddingStrategy {
    Engine(LazyEngine),
    Deterministic,
}

/// Produces unit-norm 512-d embeddings from a face image and its snapshot.
pub struct EmbeddingGenerator {
    strategy: EmbeddingStrategy,
}

impl EmbeddingGenerator {
    pub fn new(strategy: EmbeddingStrategy) -> Self {
        Self { strategy }
    }

    /// Generator that never touches an inference engine.
    pub fn deterministic() -> Self {
        Self::new(EmbeddingStrategy::Deterministic)
    }

    pub fn with_engine(engine: LazyEngine) -> Self {
        Self::new(EmbeddingStrategy::Engine(engine))
    }

    pub fn strategy_name(&self) -> &'static str {
        match self.strategy {
            EmbeddingStrategy::Engine(_) => "engine",
            EmbeddingStrategy::Deterministic => "deterministic",
        }
    }

    /// The engine slot, when the engine strategy is selected.
    pub fn engine(&self) -> Option<&LazyEngine> {
        match &self.strategy {
            EmbeddingStrategy::Engine(slot) => Some(slot),
            EmbeddingStrategy::Deterministic => None,
        }
    }

    /// Decode `image_bytes` and generate an embedding for the face in `snapshot`.
    pub fn generate(&self, image_bytes: &[u8], snapshot: &FaceDetectionSnapshot) -> Result<Embedding, GenerationError> {
        let image = decode_image(image_bytes)?;
        self.generate_from_image(&image, snapshot)
    }

    pub fn generate_from_image(
        &self,
        image: &DynamicImage,
        snapshot: &FaceDetectionSnapshot,
    ) -> Result<Embedding, GenerationError> {
        let prepared = prepare_face(image, &snapshot.bounds)?;
        self.generate_prepared(&prepared, snapshot)
    }

    /// Engine first, deterministic fallback on any engine error.
    pub fn generate_prepared(
        &self,
        prepared: &PreparedFace,
        snapshot: &FaceDetectionSnapshot,
    ) -> Result<Embedding, GenerationError> {
        if self.engine().is_some() {
            match self.engine_embedding(prepared) {
                Ok(embedding) => return Ok(embedding),
                Err(e) => tracing::warn!(error = %e, "engine embedding rejected; using deterministic fallback"),
            }
        }
        fallback_embedding(prepared, snapshot)
    }

    /// Run only the engine strategy.
    pub fn engine_embedding(&self, prepared: &PreparedFace) -> Result<Embedding, EngineError> {
        let slot = self
            .engine()
            .ok_or_else(|| EngineError::Unavailable("deterministic strategy selected".into()))?;
        let engine = slot.get()?;
        embed_with_engine(engine.as_ref(), prepared)
    }

    /// Run only the deterministic strategy.
    pub fn fallback_embedding(
        &self,
        prepared: &PreparedFace,
        snapshot: &FaceDetectionSnapshot,
    ) -> Result<Embedding, GenerationError> {
        fallback_embedding(prepared, snapshot)
    }
}

/// Run the embedding model on a prepared face and normalize its output.
///
/// Anything other than exactly `[1, 512]` finite, non-zero values is an error.
pub fn embed_with_engine(engine: &dyn InferenceEngine, prepared: &PreparedFace) -> Result<Embedding, EngineError> {
    if !engine.supports(ModelKind::Embedding) {
        return Err(EngineError::MissingModel(ModelKind::Embedding));
    }

    let input = prepared.tensor(PixelRange::Symmetric);
    let output = engine.run(ModelKind::Embedding, input.view())?;
    output.expect_shape(ModelKind::Embedding)?;

    Embedding::from_raw(&output.data, Some(ModelKind::Embedding.model_version().to_string()))
        .ok_or_else(|| EngineError::InferenceFailed("embedding has zero or non-finite norm".into()))
}

/// Statistical and geometric fingerprint the fallback is derived from.
struct Fingerprint {
    mean: f64,
    variance: f64,
    aspect_ratio: f64,
    landmark_count: u64,
    landmark_sum: f64,
}

impl Fingerprint {
    fn new(tensor: &[f32], snapshot: &FaceDetectionSnapshot) -> Self {
        let n = tensor.len().max(1) as f64;
        let mean = tensor.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = tensor.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;

        // BTreeMap iteration: fixed landmark order.
        let landmark_sum = snapshot
            .landmarks
            .values()
            .map(|p| p.x as f64 + p.y as f64)
            .sum::<f64>();

        Self {
            mean,
            variance,
            aspect_ratio: snapshot.bounds.aspect_ratio() as f64,
            landmark_count: snapshot.landmark_count() as u64,
            landmark_sum,
        }
    }

    /// SHA-256 over the domain tag, the canonical pixel bytes, and the
    /// fingerprint scalars in little-endian form.
    fn seed(&self, pixel_bytes: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(FALLBACK_DOMAIN_TAG);
        hasher.update((pixel_bytes.len() as u64).to_le_bytes());
        hasher.update(pixel_bytes);
        hasher.update(self.mean.to_le_bytes());
        hasher.update(self.variance.to_le_bytes());
        hasher.update(self.aspect_ratio.to_le_bytes());
        hasher.update(self.landmark_count.to_le_bytes());
        hasher.update(self.landmark_sum.to_le_bytes());

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hasher.finalize());
        seed
    }
}

/// Standard normal sample via Box–Muller over two 53-bit uniforms.
fn standard_normal(rng: &mut ChaCha20Rng) -> f64 {
    const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
    // u1 in (0, 1] keeps ln finite.
    let u1 = ((rng.next_u64() >> 11) as f64 + 1.0) * SCALE;
    let u2 = (rng.next_u64() >> 11) as f64 * SCALE;
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Deterministic pseudo-embedding for a prepared face.
pub fn fallback_embedding(prepared: &PreparedFace, snapshot: &FaceDetectionSnapshot) -> Result<Embedding, GenerationError> {
    let tensor = prepared.tensor(PixelRange::UnitInterval);
    let samples: Vec<f32> = tensor.iter().copied().collect();
    if samples.is_empty() {
        return Err(GenerationError::Degenerate);
    }

    let fp = Fingerprint::new(&samples, snapshot);
    let mut rng = ChaCha20Rng::from_seed(fp.seed(prepared.pixel_bytes()));

    let std_dev = fp.variance.sqrt().max(1e-6);
    let stride = (samples.len() / EMBEDDING_DIM).max(1);
    let landmark_scale = (fp.landmark_count as f64 + 1.0) * 0.01;

    let mut raw = Vec::with_capacity(EMBEDDING_DIM);
    for i in 0..EMBEDDING_DIM {
        let gaussian = standard_normal(&mut rng);

        let sample = samples[(i * stride) % samples.len()] as f64;
        let tensor_term = ((sample - fp.mean) / std_dev).clamp(-TENSOR_CLIP, TENSOR_CLIP) / TENSOR_CLIP;

        let k = (i + 1) as f64;
        let geometry_term = (fp.aspect_ratio * k * 0.1).sin() * 0.5
            + (landmark_scale * k + fp.landmark_sum * 1e-3).cos() * 0.5;

        let position_term = (2.0 * PI * i as f64 / EMBEDDING_DIM as f64).cos();

        let value = GAUSSIAN_WEIGHT * gaussian
            + TENSOR_WEIGHT * tensor_term
            + GEOMETRY_WEIGHT * geometry_term
            + POSITION_WEIGHT * position_term;
        raw.push(value as f32);
    }

    Embedding::from_raw(&raw, Some(FALLBACK_MODEL_VERSION.to_string())).ok_or(GenerationError::Degenerate)
}
