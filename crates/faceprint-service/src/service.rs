use crate::config::ServiceConfig;
use crate::worker::{spawn_worker, WorkerHandle};
use crate::ServiceError;
use faceprint_core::embedding::EmbeddingGenerator;
use faceprint_core::inference::{EngineStatus, LazyEngine, ModelKind};
use faceprint_core::matcher::{MatchResult, Matcher, SimilarityMatcher};
use faceprint_core::preprocess::{decode_image, prepare_face};
use faceprint_core::quality::{FaceQualityAnalysis, GateDecision, QualityAnalyzer, QualityGate};
use faceprint_core::snapshot::{CaptureStep, FaceDetectionSnapshot};
use faceprint_core::types::{Embedding, ImageStats};
use faceprint_core::validator::{ModelValidationReport, ModelValidator};
use faceprint_store::{EmbeddingStore, EnrolledIdentity, SqliteBackend, StoreBackend, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A gated capture turned into an embedding.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureResult {
    pub analysis: FaceQualityAnalysis,
    pub embedding: Embedding,
}

/// Snapshot of service state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub strategy: &'static str,
    pub engine: Option<EngineStatus>,
    pub enrolled: usize,
    pub similarity_threshold: f32,
    pub quality_min_overall: f32,
    pub inference_timeout_ms: u64,
}

/// Enrollment and verification over an embedding store.
pub struct FaceprintService<B: StoreBackend> {
    config: ServiceConfig,
    analyzer: QualityAnalyzer,
    gate: QualityGate,
    matcher: SimilarityMatcher,
    generator: Arc<EmbeddingGenerator>,
    worker: Option<WorkerHandle>,
    store: EmbeddingStore<B>,
    validator: ModelValidator,
}

impl FaceprintService<SqliteBackend> {
    /// Build the production service: SQLite store at `config.db_path` and,
    /// when enabled, an ONNX engine from `config.model_dir`.
    ///
    /// Runs startup certification when `require_certification` is set.
    pub async fn open(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;

        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ServiceError::DataDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let store = EmbeddingStore::new(SqliteBackend::open(&config.db_path)?);

        let generator = if config.engine_enabled {
            EmbeddingGenerator::with_engine(LazyEngine::onnx(config.model_dir.clone()))
        } else {
            tracing::info!("inference engine disabled; using deterministic embeddings");
            EmbeddingGenerator::deterministic()
        };

        let service = Self::new(config, generator, store)?;
        if service.config.require_certification {
            service.certify().await?;
        }
        Ok(service)
    }
}

impl<B: StoreBackend> FaceprintService<B> {
    /// Assemble a service from explicitly constructed parts.
    pub fn new(config: ServiceConfig, generator: EmbeddingGenerator, store: EmbeddingStore<B>) -> Result<Self, ServiceError> {
        let generator = Arc::new(generator);
        let worker = match generator.engine() {
            Some(_) => Some(spawn_worker(Arc::clone(&generator))?),
            None => None,
        };

        tracing::info!(
            strategy = generator.strategy_name(),
            threshold = config.similarity_threshold,
            timeout_ms = config.inference_timeout_ms,
            "faceprint service ready"
        );

        Ok(Self {
            analyzer: QualityAnalyzer::new(),
            gate: QualityGate::new(config.quality_min_overall),
            matcher: SimilarityMatcher::new(config.similarity_threshold),
            validator: ModelValidator::new(config.validator_config()),
            generator,
            worker,
            store,
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &EmbeddingStore<B> {
        &self.store
    }

    /// Replace the validator thresholds (e.g. for a faster on-demand run).
    pub fn set_validator(&mut self, validator: ModelValidator) {
        self.validator = validator;
    }

    pub fn analyze_quality(
        &self,
        snapshot: &FaceDetectionSnapshot,
        stats: &ImageStats,
        step: CaptureStep,
    ) -> FaceQualityAnalysis {
        self.analyzer.analyze(snapshot, stats, step)
    }

    /// Decode `image` for its statistics and analyze the capture.
    pub async fn analyze_capture(
        &self,
        image: Arc<[u8]>,
        snapshot: &FaceDetectionSnapshot,
        step: CaptureStep,
    ) -> Result<FaceQualityAnalysis, ServiceError> {
        let stats = tokio::task::spawn_blocking(move || decode_image(&image).map(|img| ImageStats::from_image(&img)))
            .await??;
        Ok(self.analyze_quality(snapshot, &stats, step))
    }

    pub fn gate(&self, analysis: &FaceQualityAnalysis) -> GateDecision {
        self.gate.evaluate(analysis)
    }

    /// Embedding for the face in `snapshot`, bounded by the configured timeout.
    pub async fn generate_embedding(
        &self,
        image: Arc<[u8]>,
        snapshot: &FaceDetectionSnapshot,
    ) -> Result<Embedding, ServiceError> {
        self.generate_embedding_with_timeout(image, snapshot, self.config.inference_timeout())
            .await
    }

    /// Embedding for the face in `snapshot`.
    ///
    /// Only an undecodable image or an empty crop is an error. Engine failures,
    /// malformed engine output and timeouts fall back to the deterministic
    /// strategy.
    pub async fn generate_embedding_with_timeout(
        &self,
        image: Arc<[u8]>,
        snapshot: &FaceDetectionSnapshot,
        timeout: Duration,
    ) -> Result<Embedding, ServiceError> {
        let bounds = snapshot.bounds;
        let prepared = tokio::task::spawn_blocking(move || {
            let img = decode_image(&image)?;
            prepare_face(&img, &bounds)
        })
        .await??;

        if let (Some(worker), Some(slot)) = (&self.worker, self.generator.engine()) {
            if matches!(slot.status(), EngineStatus::Failed(_)) {
                tracing::debug!("engine marked failed; skipping to deterministic fallback");
            } else {
                match worker.embed(prepared.clone(), timeout).await {
                    Ok(embedding) => return Ok(embedding),
                    Err(e) => tracing::warn!(error = %e, "engine embedding failed; using deterministic fallback"),
                }
            }
        }

        let generator = Arc::clone(&self.generator);
        let snapshot = snapshot.clone();
        let embedding =
            tokio::task::spawn_blocking(move || generator.fallback_embedding(&prepared, &snapshot)).await??;
        Ok(embedding)
    }

    /// Gate a capture on quality, then embed it.
    pub async fn capture(
        &self,
        image: Arc<[u8]>,
        snapshot: &FaceDetectionSnapshot,
        step: CaptureStep,
    ) -> Result<CaptureResult, ServiceError> {
        let analysis = self.analyze_capture(Arc::clone(&image), snapshot, step).await?;
        if let GateDecision::Retry { issues, recommendations } = self.gate(&analysis) {
            tracing::info!(overall = analysis.overall, ?issues, "capture rejected by quality gate");
            return Err(ServiceError::QualityRejected {
                overall: analysis.overall,
                issues,
                recommendations,
            });
        }
        let embedding = self.generate_embedding(image, snapshot).await?;
        Ok(CaptureResult { analysis, embedding })
    }

    pub fn match_embeddings(&self, a: &Embedding, b: &Embedding) -> Result<bool, ServiceError> {
        Ok(self.matcher.is_match(a, b)?)
    }

    /// Store `embedding` as the reference for `identity`, replacing any previous one.
    pub fn enroll(&self, identity: &str, embedding: &Embedding) -> Result<(), ServiceError> {
        self.store.save(identity, embedding)?;
        Ok(())
    }

    /// Gate, embed and enroll one capture.
    pub async fn enroll_capture(
        &self,
        identity: &str,
        image: Arc<[u8]>,
        snapshot: &FaceDetectionSnapshot,
        step: CaptureStep,
    ) -> Result<CaptureResult, ServiceError> {
        let captured = self.capture(image, snapshot, step).await?;
        self.enroll(identity, &captured.embedding)?;
        Ok(captured)
    }

    /// Compare `candidate` against the reference enrolled for `identity`.
    ///
    /// A missing reference and a reference that fails its integrity check are
    /// distinct errors; see [`ServiceError::is_not_found`] and
    /// [`ServiceError::is_integrity_failure`]. Embeddings from different
    /// models are never compared ([`ServiceError::ModelMismatch`]).
    pub fn verify(&self, identity: &str, candidate: &Embedding) -> Result<MatchResult, ServiceError> {
        let reference = match self.store.load(identity) {
            Ok(reference) => reference,
            Err(e) => {
                if matches!(e, StoreError::Integrity(_)) {
                    tracing::error!(identity, "stored reference failed integrity check; refusing to verify");
                }
                return Err(e.into());
            }
        };

        if reference.model_version != candidate.model_version {
            tracing::warn!(
                identity,
                reference = ?reference.model_version,
                candidate = ?candidate.model_version,
                "refusing to compare embeddings from different models"
            );
            return Err(ServiceError::ModelMismatch {
                identity: identity.to_string(),
                reference: reference.model_version,
                candidate: candidate.model_version.clone(),
            });
        }

        let result = self.matcher.compare(candidate, &reference)?;
        tracing::info!(identity, matched = result.matched, similarity = result.similarity, "verification");
        Ok(result)
    }

    /// Gate and embed one capture, then verify it against `identity`.
    pub async fn verify_capture(
        &self,
        identity: &str,
        image: Arc<[u8]>,
        snapshot: &FaceDetectionSnapshot,
        step: CaptureStep,
    ) -> Result<MatchResult, ServiceError> {
        let captured = self.capture(image, snapshot, step).await?;
        self.verify(identity, &captured.embedding)
    }

    /// Best-matching enrolled identity for `probe`, if any.
    ///
    /// References that fail their integrity check or come from a different
    /// model than `probe` are left out of the search.
    pub fn identify(&self, probe: &Embedding) -> Result<Option<(String, MatchResult)>, ServiceError> {
        let mut gallery = Vec::new();
        for enrolled in self.store.identities()? {
            match self.store.load(&enrolled.identity) {
                Ok(embedding) if embedding.model_version != probe.model_version => {
                    tracing::debug!(
                        identity = %enrolled.identity,
                        reference = ?embedding.model_version,
                        "skipping reference from a different model"
                    );
                }
                Ok(embedding) => gallery.push((enrolled.identity, embedding)),
                Err(StoreError::NotFound(_)) => {}
                Err(StoreError::Integrity(id)) => {
                    tracing::error!(identity = %id, "skipping reference that failed integrity check");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let best = self.matcher.best_match(probe, &gallery)?;
        Ok(best.map(|(id, result)| (id.to_string(), result)))
    }

    /// Remove the reference for `identity`. Returns whether one existed.
    pub fn remove(&self, identity: &str) -> Result<bool, ServiceError> {
        Ok(self.store.delete(identity)?)
    }

    pub fn identities(&self) -> Result<Vec<EnrolledIdentity>, ServiceError> {
        Ok(self.store.identities()?)
    }

    /// Run the model validator against the engine.
    ///
    /// Never fails: an absent or unloadable engine yields a report in which
    /// every model fails.
    pub async fn validate_models(&self) -> ModelValidationReport {
        let Some(worker) = &self.worker else {
            return ModelValidationReport::unavailable("inference engine disabled");
        };
        match worker.validate(self.validator.clone(), None, self.validation_timeout(ModelKind::ALL.len())).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "model validation could not run");
                ModelValidationReport::unavailable(&e.to_string())
            }
        }
    }

    /// Upper bound for validating `models` sub-models: every run may take up
    /// to the inference timeout.
    fn validation_timeout(&self, models: usize) -> Duration {
        let c = self.validator.config();
        let runs = 1 + c.consistency_runs + c.performance_runs + c.accuracy_trials;
        self.config.inference_timeout() * (runs * models) as u32
    }

    /// Certify the embedding model; on failure pin the generator to the
    /// deterministic strategy until the next reload.
    pub async fn certify(&self) -> Result<bool, ServiceError> {
        let (Some(worker), Some(slot)) = (&self.worker, self.generator.engine()) else {
            return Ok(false);
        };

        let report = match worker
            .validate(self.validator.clone(), Some(ModelKind::Embedding), self.validation_timeout(1))
            .await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "certification could not run; using deterministic fallback");
                slot.disable(format!("certification could not run: {e}"));
                return Ok(false);
            }
        };

        if report.overall {
            tracing::info!(engine = %report.engine, "embedding model certified");
        } else {
            let detail = report
                .check(ModelKind::Embedding)
                .map(|c| c.detail.clone())
                .unwrap_or_default();
            tracing::warn!(%detail, "embedding model failed certification; using deterministic fallback");
            slot.disable(format!("embedding model failed certification: {detail}"));
        }
        Ok(report.overall)
    }

    /// Drop the loaded (or failed) engine so the next call loads it again.
    ///
    /// Re-runs certification when the service requires it.
    pub async fn reload_engine(&self) -> Result<Option<EngineStatus>, ServiceError> {
        let Some(slot) = self.generator.engine() else {
            return Ok(None);
        };
        slot.reload();
        if self.config.require_certification {
            self.certify().await?;
        }
        Ok(Some(slot.status()))
    }

    pub fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            strategy: self.generator.strategy_name(),
            engine: self.generator.engine().map(LazyEngine::status),
            enrolled: self.store.identities()?.len(),
            similarity_threshold: self.matcher.threshold(),
            quality_min_overall: self.gate.min_overall,
            inference_timeout_ms: self.config.inference_timeout_ms,
        })
    }
}
