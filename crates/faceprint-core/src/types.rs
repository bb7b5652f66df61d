use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of every face embedding produced or accepted by this crate.
pub const EMBEDDING_DIM: usize = 512;

/// Accepted deviation of an embedding's L2 norm from 1.0.
pub const UNIT_NORM_TOLERANCE: f64 = 1e-5;

/// Two vectors that must have the same length did not.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("shape mismatch: expected {expected} values, got {actual}")]
pub struct ShapeMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// L2-normalized face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet_512d", "fallback-v1").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Normalize `raw` to unit length and wrap it.
    ///
    /// Returns `None` for a zero, non-finite or wrong-length vector; callers
    /// never receive a partially normalized embedding.
    pub fn from_raw(raw: &[f32], model_version: Option<String>) -> Option<Self> {
        if raw.len() != EMBEDDING_DIM {
            return None;
        }
        let values = l2_normalize(raw)?;
        Some(Self { values, model_version })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// L2 norm, accumulated in f64.
    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_unit_norm(&self) -> bool {
        (self.norm() - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }

    /// Similarity of two unit-norm embeddings: their dot product, which equals
    /// cosine similarity. Result in [-1, 1]; higher = more similar.
    ///
    /// Processes all dimensions unconditionally.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, ShapeMismatch> {
        if self.values.len() != other.values.len() {
            return Err(ShapeMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }

        let mut dot = 0.0f64;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += (*a as f64) * (*b as f64);
        }
        Ok(dot.clamp(-1.0, 1.0) as f32)
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, ShapeMismatch> {
        if self.values.len() != other.values.len() {
            return Err(ShapeMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// Scale `raw` to unit L2 norm. `None` if the norm is zero or not finite.
pub fn l2_normalize(raw: &[f32]) -> Option<Vec<f32>> {
    let norm = raw
        .iter()
        .map(|&v| (v as f64) * (v as f64))
        .sum::<f64>()
        .sqrt();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return None;
    }
    Some(raw.iter().map(|&v| ((v as f64) / norm) as f32).collect())
}

/// Cheap statistics of the source image the snapshot was detected on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageStats {
    pub width: u32,
    pub height: u32,
    /// Mean luma (0.0–255.0), when the pixels were available.
    #[serde(default)]
    pub mean_luminance: Option<f32>,
}

impl ImageStats {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, mean_luminance: None }
    }

    pub fn from_image(image: &image::DynamicImage) -> Self {
        let luma = image.to_luma8();
        let pixels = luma.as_raw();
        let mean_luminance = if pixels.is_empty() {
            None
        } else {
            let sum: u64 = pixels.iter().map(|&p| p as u64).sum();
            Some(sum as f32 / pixels.len() as f32)
        };
        Self {
            width: image.width(),
            height: image.height(),
            mean_luminance,
        }
    }

    pub fn area(&self) -> f32 {
        self.width as f32 * self.height as f32
    }
}
