//! Identity decision from embedding similarity.

use crate::types::{Embedding, ShapeMismatch};
use serde::Serialize;

/// Similarity at or above which two embeddings are the same identity.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of comparing a probe embedding against a reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
}

/// Strategy for comparing a probe embedding against an enrolled reference.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, reference: &Embedding) -> Result<MatchResult, ShapeMismatch>;
}

/// Dot-product matcher over unit-norm embeddings with a fixed threshold.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityMatcher {
    threshold: f32,
}

impl Default for SimilarityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl SimilarityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn similarity(&self, a: &Embedding, b: &Embedding) -> Result<f32, ShapeMismatch> {
        a.similarity(b)
    }

    pub fn is_match(&self, a: &Embedding, b: &Embedding) -> Result<bool, ShapeMismatch> {
        Ok(self.similarity(a, b)? >= self.threshold)
    }

    /// Best match of `probe` within a gallery of `(identity, embedding)` pairs.
    ///
    /// Always compares every entry, with no early exit, so timing does not
    /// reveal gallery size or match position.
    pub fn best_match<'g>(
        &self,
        probe: &Embedding,
        gallery: &'g [(String, Embedding)],
    ) -> Result<Option<(&'g str, MatchResult)>, ShapeMismatch> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, (_, reference)) in gallery.iter().enumerate() {
            let sim = probe.similarity(reference)?;
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        Ok(best_idx.map(|idx| {
            (
                gallery[idx].0.as_str(),
                MatchResult {
                    matched: best_sim >= self.threshold,
                    similarity: best_sim,
                },
            )
        }))
    }
}

impl Matcher for SimilarityMatcher {
    fn compare(&self, probe: &Embedding, reference: &Embedding) -> Result<MatchResult, ShapeMismatch> {
        let similarity = self.similarity(probe, reference)?;
        Ok(MatchResult {
            matched: similarity >= self.threshold,
            similarity,
        })
    }
}
