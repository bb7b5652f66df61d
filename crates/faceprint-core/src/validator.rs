//! Offline certification of an inference engine.
//!
//! Each sub-model runs four checks: tensor shapes, run-to-run consistency,
//! latency, and output sanity over synthetic trials. Scores are synthetic
//! self-test results, not real-world accuracy benchmarks.

use crate::inference::{InferenceEngine, ModelKind, TensorOutput, EMOTION_LABELS};
use ndarray::Array4;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Fewest repeated runs the consistency check accepts.
pub const MIN_CONSISTENCY_RUNS: usize = 2;

/// Thresholds and run counts of the validator.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub consistency_runs: usize,
    /// Minimum pairwise cosine similarity across repeated runs.
    pub min_consistency: f32,
    pub performance_runs: usize,
    pub max_avg_latency: Duration,
    /// Maximum latency standard deviation relative to the mean.
    pub max_latency_cv: f64,
    /// Standard deviations below this are always accepted (timer noise).
    pub latency_jitter_floor: Duration,
    pub accuracy_trials: usize,
    pub min_accuracy: f32,
    /// Fraction of sub-models that must pass for the report to pass.
    pub min_pass_fraction: f32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            consistency_runs: 10,
            min_consistency: 0.9,
            performance_runs: 20,
            max_avg_latency: Duration::from_millis(500),
            max_latency_cv: 0.5,
            latency_jitter_floor: Duration::from_millis(5),
            accuracy_trials: 100,
            min_accuracy: 0.95,
            min_pass_fraction: 0.95,
        }
    }
}

/// Outcome of validating one sub-model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCheck {
    pub model: ModelKind,
    pub passed: bool,
    pub structure_ok: bool,
    /// Minimum pairwise cosine similarity across repeated runs.
    pub consistency: f32,
    pub avg_latency_ms: f64,
    pub latency_stddev_ms: f64,
    /// Fraction of synthetic trials whose output passed the sanity checks.
    pub accuracy: f32,
    pub detail: String,
}

impl ModelCheck {
    fn failed(model: ModelKind, detail: impl Into<String>) -> Self {
        Self {
            model,
            passed: false,
            structure_ok: false,
            consistency: 0.0,
            avg_latency_ms: 0.0,
            latency_stddev_ms: 0.0,
            accuracy: 0.0,
            detail: detail.into(),
        }
    }
}

/// Pass/fail report across all sub-models.
#[derive(Debug, Clone, Serialize)]
pub struct ModelValidationReport {
    pub engine: String,
    pub models: Vec<ModelCheck>,
    pub pass_fraction: f32,
    pub overall: bool,
}

impl ModelValidationReport {
    /// Report for a process with no usable engine: every model fails.
    pub fn unavailable(reason: &str) -> Self {
        Self {
            engine: "none".into(),
            models: ModelKind::ALL
                .iter()
                .map(|&kind| ModelCheck::failed(kind, format!("engine unavailable: {reason}")))
                .collect(),
            pass_fraction: 0.0,
            overall: false,
        }
    }

    pub fn check(&self, kind: ModelKind) -> Option<&ModelCheck> {
        self.models.iter().find(|m| m.model == kind)
    }
}

/// Runs the certification checks against an engine.
#[derive(Debug, Clone, Default)]
pub struct ModelValidator {
    config: ValidatorConfig,
}

impl ModelValidator {
    /// Consistency needs at least one pair of runs to compare, so fewer than
    /// [`MIN_CONSISTENCY_RUNS`] are raised to that.
    pub fn new(mut config: ValidatorConfig) -> Self {
        config.consistency_runs = config.consistency_runs.max(MIN_CONSISTENCY_RUNS);
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate every sub-model.
    pub fn validate_all(&self, engine: &dyn InferenceEngine) -> ModelValidationReport {
        let models: Vec<ModelCheck> = ModelKind::ALL
            .iter()
            .map(|&kind| self.validate_model(engine, kind))
            .collect();

        let passed = models.iter().filter(|m| m.passed).count();
        let pass_fraction = passed as f32 / models.len() as f32;
        let overall = pass_fraction >= self.config.min_pass_fraction;

        tracing::info!(engine = engine.name(), passed, total = models.len(), overall, "model validation finished");

        ModelValidationReport {
            engine: engine.name().to_string(),
            models,
            pass_fraction,
            overall,
        }
    }

    /// Validate one sub-model.
    pub fn validate_model(&self, engine: &dyn InferenceEngine, kind: ModelKind) -> ModelCheck {
        if !engine.supports(kind) {
            return ModelCheck::failed(kind, "model not loaded");
        }

        if let Err(detail) = self.check_structure(engine, kind) {
            tracing::warn!(model = %kind, %detail, "structure check failed");
            return ModelCheck::failed(kind, detail);
        }

        let mut failures = Vec::new();

        let consistency = self.check_consistency(engine, kind);
        if consistency < self.config.min_consistency {
            failures.push(format!(
                "consistency {consistency:.3} below {:.3}",
                self.config.min_consistency
            ));
        }

        let (avg_latency, stddev) = self.measure_latency(engine, kind);
        let avg_ms = avg_latency.as_secs_f64() * 1e3;
        let stddev_ms = stddev.as_secs_f64() * 1e3;
        if avg_latency > self.config.max_avg_latency {
            failures.push(format!(
                "average latency {avg_ms:.1}ms above {:.1}ms",
                self.config.max_avg_latency.as_secs_f64() * 1e3
            ));
        }
        let jitter_ok = stddev <= self.config.latency_jitter_floor
            || stddev.as_secs_f64() <= avg_latency.as_secs_f64() * self.config.max_latency_cv;
        if !jitter_ok {
            failures.push(format!("latency stddev {stddev_ms:.1}ms too high for mean {avg_ms:.1}ms"));
        }

        let accuracy = self.check_accuracy(engine, kind);
        if accuracy < self.config.min_accuracy {
            failures.push(format!("accuracy {accuracy:.3} below {:.3}", self.config.min_accuracy));
        }

        let passed = failures.is_empty();
        let detail = if passed { "all checks passed".to_string() } else { failures.join("; ") };

        tracing::debug!(model = %kind, passed, consistency, avg_ms, accuracy, "model validated");

        ModelCheck {
            model: kind,
            passed,
            structure_ok: true,
            consistency,
            avg_latency_ms: avg_ms,
            latency_stddev_ms: stddev_ms,
            accuracy,
            detail,
        }
    }

    fn check_structure(&self, engine: &dyn InferenceEngine, kind: ModelKind) -> Result<(), String> {
        let input = Array4::<f32>::zeros(kind.input_shape());
        let output = engine
            .run(kind, input.view())
            .map_err(|e| format!("inference on zero input failed: {e}"))?;
        output.expect_shape(kind).map_err(|e| e.to_string())
    }

    /// Minimum pairwise cosine similarity over repeated runs of one input.
    fn check_consistency(&self, engine: &dyn InferenceEngine, kind: ModelKind) -> f32 {
        let input = synthetic_input(kind, 0);
        let mut outputs = Vec::with_capacity(self.config.consistency_runs);
        for _ in 0..self.config.consistency_runs {
            match engine.run(kind, input.view()) {
                Ok(out) => outputs.push(out.data),
                Err(e) => {
                    tracing::warn!(model = %kind, error = %e, "consistency run failed");
                    return 0.0;
                }
            }
        }

        let mut min_sim = 1.0f32;
        for i in 0..outputs.len() {
            for j in (i + 1)..outputs.len() {
                min_sim = min_sim.min(cosine(&outputs[i], &outputs[j]));
            }
        }
        min_sim
    }

    /// Mean and standard deviation of per-run latency.
    fn measure_latency(&self, engine: &dyn InferenceEngine, kind: ModelKind) -> (Duration, Duration) {
        let input = synthetic_input(kind, 1);
        let mut samples = Vec::with_capacity(self.config.performance_runs);
        for _ in 0..self.config.performance_runs {
            let start = Instant::now();
            let result = engine.run(kind, input.view());
            let elapsed = start.elapsed();
            if result.is_err() {
                // A failed run counts as exceeding any budget.
                return (Duration::MAX, Duration::ZERO);
            }
            samples.push(elapsed.as_secs_f64());
        }
        if samples.is_empty() {
            return (Duration::ZERO, Duration::ZERO);
        }

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        (Duration::from_secs_f64(mean), Duration::from_secs_f64(var.sqrt()))
    }

    /// Fraction of synthetic trials with sane output.
    fn check_accuracy(&self, engine: &dyn InferenceEngine, kind: ModelKind) -> f32 {
        if self.config.accuracy_trials == 0 {
            return 1.0;
        }
        let sane = (0..self.config.accuracy_trials)
            .filter(|&trial| {
                let input = synthetic_input(kind, trial as u64 + 2);
                engine
                    .run(kind, input.view())
                    .map(|out| output_is_sane(kind, &out))
                    .unwrap_or(false)
            })
            .count();
        sane as f32 / self.config.accuracy_trials as f32
    }
}

/// Reproducible random input in the model's expected value range.
fn synthetic_input(kind: ModelKind, trial: u64) -> Array4<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64((kind as u64) << 32 | trial);
    let (lo, hi) = match kind {
        ModelKind::Embedding => (-1.0f32, 1.0f32),
        _ => (0.0, 1.0),
    };
    Array4::from_shape_simple_fn(kind.input_shape(), || rng.gen_range(lo..=hi))
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 && nb == 0.0 {
        return 1.0;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom > 0.0 { (dot / denom) as f32 } else { 0.0 }
}

/// Basic range and label validity of one output.
fn output_is_sane(kind: ModelKind, out: &TensorOutput) -> bool {
    if out.expect_shape(kind).is_err() || out.data.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let d = &out.data;
    match kind {
        ModelKind::Embedding => d.iter().map(|v| v * v).sum::<f32>() > 1e-12,
        ModelKind::Emotion => {
            let in_range = d.iter().all(|p| (0.0..=1.0).contains(p));
            let total: f32 = d.iter().sum();
            let label = d
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            in_range && (total - 1.0).abs() <= 0.05 && label.is_some_and(|i| i < EMOTION_LABELS.len())
        }
        ModelKind::AgeGender => {
            (0.0..=100.0).contains(&d[0]) && (0.0..=1.0).contains(&d[1]) && (0.0..=1.0).contains(&d[2])
        }
        ModelKind::FaceAnalysis => d.iter().any(|v| *v != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::EngineError;
    use crate::test_support::FakeEngine;
    use ndarray::ArrayView4;

    fn quick() -> ModelValidator {
        ModelValidator::new(ValidatorConfig {
            accuracy_trials: 20,
            // Debug builds are slow; only the relative checks matter here.
            max_avg_latency: Duration::from_secs(30),
            latency_jitter_floor: Duration::from_secs(30),
            ..ValidatorConfig::default()
        })
    }

    /// Emotion outputs that are not probabilities.
    struct BadEmotionEngine;

    impl InferenceEngine for BadEmotionEngine {
        fn name(&self) -> &str {
            "bad-emotion"
        }
        fn supports(&self, _kind: ModelKind) -> bool {
            true
        }
        fn run(&self, kind: ModelKind, input: ArrayView4<'_, f32>) -> Result<TensorOutput, EngineError> {
            if kind == ModelKind::Emotion {
                return Ok(TensorOutput { shape: vec![1, 7], data: vec![3.0; 7] });
            }
            FakeEngine::default().run(kind, input)
        }
    }

    /// Embedding model with the wrong output width.
    struct NarrowEmbeddingEngine;

    impl InferenceEngine for NarrowEmbeddingEngine {
        fn name(&self) -> &str {
            "narrow"
        }
        fn supports(&self, _kind: ModelKind) -> bool {
            true
        }
        fn run(&self, kind: ModelKind, input: ArrayView4<'_, f32>) -> Result<TensorOutput, EngineError> {
            if kind == ModelKind::Embedding {
                return Ok(TensorOutput { shape: vec![1, 128], data: vec![0.1; 128] });
            }
            FakeEngine::default().run(kind, input)
        }
    }

    /// Sleeps long enough to blow a tight latency budget.
    struct SlowEngine;

    impl InferenceEngine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }
        fn supports(&self, kind: ModelKind) -> bool {
            kind == ModelKind::AgeGender
        }
        fn run(&self, kind: ModelKind, input: ArrayView4<'_, f32>) -> Result<TensorOutput, EngineError> {
            std::thread::sleep(Duration::from_millis(5));
            FakeEngine::default().run(kind, input)
        }
    }

    #[test]
    fn test_well_behaved_engine_passes() {
        let report = quick().validate_all(&FakeEngine::default());
        for check in &report.models {
            assert!(check.passed, "{}: {}", check.model, check.detail);
            assert!(check.structure_ok);
            assert!(check.consistency > 0.999);
            assert_eq!(check.accuracy, 1.0);
        }
        assert!(report.overall);
        assert_eq!(report.pass_fraction, 1.0);
        assert_eq!(report.engine, "fake");
    }

    #[test]
    fn test_missing_model_fails_overall() {
        let engine = FakeEngine { missing: vec![ModelKind::AgeGender], ..FakeEngine::default() };
        let report = quick().validate_all(&engine);
        let check = report.check(ModelKind::AgeGender).unwrap();
        assert!(!check.passed);
        assert_eq!(check.detail, "model not loaded");
        assert!(report.check(ModelKind::Embedding).unwrap().passed);
        assert!((report.pass_fraction - 0.75).abs() < 1e-6);
        assert!(!report.overall);
    }

    #[test]
    fn test_inconsistent_engine_fails() {
        let engine = FakeEngine { noisy: true, ..FakeEngine::default() };
        let check = quick().validate_model(&engine, ModelKind::Embedding);
        assert!(check.structure_ok);
        assert!(!check.passed);
        assert!(check.consistency < 0.9);
        assert!(check.detail.contains("consistency"));
    }

    #[test]
    fn test_wrong_output_shape_fails_structure() {
        let check = quick().validate_model(&NarrowEmbeddingEngine, ModelKind::Embedding);
        assert!(!check.passed);
        assert!(!check.structure_ok);
        assert!(check.detail.contains("shape"));
    }

    #[test]
    fn test_invalid_probabilities_fail_accuracy() {
        let check = quick().validate_model(&BadEmotionEngine, ModelKind::Emotion);
        assert!(check.structure_ok);
        assert_eq!(check.accuracy, 0.0);
        assert!(!check.passed);
    }

    #[test]
    fn test_latency_budget() {
        let validator = ModelValidator::new(ValidatorConfig {
            performance_runs: 3,
            accuracy_trials: 1,
            consistency_runs: 2,
            max_avg_latency: Duration::from_millis(1),
            ..ValidatorConfig::default()
        });
        let check = validator.validate_model(&SlowEngine, ModelKind::AgeGender);
        assert!(!check.passed);
        assert!(check.avg_latency_ms >= 5.0);
        assert!(check.detail.contains("latency"));
    }

    #[test]
    fn test_single_consistency_run_still_compares_pairs() {
        let validator = ModelValidator::new(ValidatorConfig {
            consistency_runs: 1,
            ..quick().config().clone()
        });
        assert_eq!(validator.config().consistency_runs, MIN_CONSISTENCY_RUNS);

        let engine = FakeEngine { noisy: true, ..FakeEngine::default() };
        let check = validator.validate_model(&engine, ModelKind::Embedding);
        assert!(!check.passed);
        assert!(check.consistency < 0.9);

        let zero = ModelValidator::new(ValidatorConfig { consistency_runs: 0, ..ValidatorConfig::default() });
        assert_eq!(zero.config().consistency_runs, MIN_CONSISTENCY_RUNS);
    }

    #[test]
    fn test_unavailable_report() {
        let report = ModelValidationReport::unavailable("no model directory");
        assert_eq!(report.models.len(), 4);
        assert!(report.models.iter().all(|m| !m.passed));
        assert!(!report.overall);
    }

    #[test]
    fn test_synthetic_input_is_reproducible() {
        let a = synthetic_input(ModelKind::Emotion, 3);
        let b = synthetic_input(ModelKind::Emotion, 3);
        assert_eq!(a, b);
        assert_eq!(a.shape(), &[1, 48, 48, 1]);
        assert_ne!(a, synthetic_input(ModelKind::Emotion, 4));
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
