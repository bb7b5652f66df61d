//! Inference engine abstraction and its ONNX Runtime implementation.
//!
//! The engine is optional: everything that consumes it must keep working when
//! it is absent or broken. [`LazyEngine`] loads it once on first use and
//! memoizes both success and failure.

use ndarray::ArrayView4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Labels of the emotion model's seven output classes, in output order.
pub const EMOTION_LABELS: [&str; 7] = ["angry", "disgust", "fear", "happy", "sad", "surprise", "neutral"];

/// The sub-models an engine may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Embedding,
    Emotion,
    AgeGender,
    FaceAnalysis,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Embedding,
        ModelKind::Emotion,
        ModelKind::AgeGender,
        ModelKind::FaceAnalysis,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Embedding => "embedding",
            ModelKind::Emotion => "emotion",
            ModelKind::AgeGender => "age_gender",
            ModelKind::FaceAnalysis => "face_analysis",
        }
    }

    /// Model identifier recorded on embeddings and in reports.
    pub fn model_version(&self) -> &'static str {
        match self {
            ModelKind::Embedding => "facenet_512d",
            ModelKind::Emotion => "emotion_detection",
            ModelKind::AgeGender => "age_gender",
            ModelKind::FaceAnalysis => "face_analysis",
        }
    }

    /// File name of the model inside the model directory.
    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.model_version())
    }

    /// Expected NHWC input shape.
    pub fn input_shape(&self) -> [usize; 4] {
        match self {
            ModelKind::Embedding => [1, 160, 160, 3],
            ModelKind::Emotion => [1, 48, 48, 1],
            ModelKind::AgeGender => [1, 224, 224, 3],
            ModelKind::FaceAnalysis => [1, 112, 112, 3],
        }
    }

    /// Expected output shape.
    pub fn output_shape(&self) -> [usize; 2] {
        match self {
            ModelKind::Embedding => [1, 512],
            ModelKind::Emotion => [1, EMOTION_LABELS.len()],
            ModelKind::AgeGender => [1, 3],
            ModelKind::FaceAnalysis => [1, 128],
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("inference engine unavailable: {0}")]
    Unavailable(String),
    #[error("model file not found: {0} (place the ONNX export in the model directory)")]
    ModelNotFound(String),
    #[error("engine does not provide the {0} model")]
    MissingModel(ModelKind),
    #[error("{kind} model input shape mismatch: expected {expected:?}, got {actual:?}")]
    InputShape {
        kind: ModelKind,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{kind} model output shape mismatch: expected {expected:?}, got {actual:?}")]
    OutputShape {
        kind: ModelKind,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("inference timed out after {0:?}")]
    TimedOut(Duration),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw output tensor of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorOutput {
    /// Reject any output whose shape or element count differs from the
    /// model's contract.
    pub fn expect_shape(&self, kind: ModelKind) -> Result<(), EngineError> {
        let expected = kind.output_shape();
        let len: usize = expected.iter().product();
        if self.shape != expected || self.data.len() != len {
            return Err(EngineError::OutputShape {
                kind,
                expected: expected.to_vec(),
                actual: self.shape.clone(),
            });
        }
        Ok(())
    }
}

/// Tensor-in / tensor-out contract of a deep-learning backend.
///
/// Implementations must be safe to share across threads; calls may block.
pub trait InferenceEngine: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &str;

    fn supports(&self, kind: ModelKind) -> bool;

    fn run(&self, kind: ModelKind, input: ArrayView4<'_, f32>) -> Result<TensorOutput, EngineError>;
}

/// Check `input` against the model's input contract before running it.
pub fn check_input_shape(kind: ModelKind, input: &ArrayView4<'_, f32>) -> Result<(), EngineError> {
    let expected = kind.input_shape();
    if input.shape() != expected {
        return Err(EngineError::InputShape {
            kind,
            expected: expected.to_vec(),
            actual: input.shape().to_vec(),
        });
    }
    Ok(())
}

/// ONNX Runtime backend: one session per available sub-model.
pub struct OnnxEngine {
    sessions: HashMap<ModelKind, Mutex<Session>>,
    model_dir: PathBuf,
}

impl OnnxEngine {
    /// Load every model found in `model_dir`.
    ///
    /// The embedding model is required; the others are optional and only
    /// matter to the model validator.
    pub fn load(model_dir: &Path) -> Result<Self, EngineError> {
        let mut sessions = HashMap::new();

        for kind in ModelKind::ALL {
            let path = model_dir.join(kind.file_name());
            if !path.exists() {
                if kind == ModelKind::Embedding {
                    return Err(EngineError::ModelNotFound(path.display().to_string()));
                }
                tracing::warn!(model = %kind, path = %path.display(), "optional model not found");
                continue;
            }
            let session = Self::load_session(&path)?;
            sessions.insert(kind, Mutex::new(session));
        }

        Ok(Self {
            sessions,
            model_dir: model_dir.to_path_buf(),
        })
    }

    fn load_session(path: &Path) -> Result<Session, EngineError> {
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?;

        tracing::info!(
            path = %path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX model"
        );

        Ok(session)
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn session(&self, kind: ModelKind) -> Result<MutexGuard<'_, Session>, EngineError> {
        let slot = self.sessions.get(&kind).ok_or(EngineError::MissingModel(kind))?;
        slot.lock()
            .map_err(|_| EngineError::InferenceFailed(format!("{kind} session lock poisoned")))
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        "onnx"
    }

    fn supports(&self, kind: ModelKind) -> bool {
        self.sessions.contains_key(&kind)
    }

    fn run(&self, kind: ModelKind, input: ArrayView4<'_, f32>) -> Result<TensorOutput, EngineError> {
        check_input_shape(kind, &input)?;

        let mut session = self.session(kind)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input)?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::InferenceFailed(format!("{kind} output extraction: {e}")))?;

        Ok(TensorOutput {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.to_vec(),
        })
    }
}

type EngineLoader = Box<dyn Fn() -> Result<Arc<dyn InferenceEngine>, EngineError> + Send + Sync>;

enum SlotState {
    Unloaded,
    Ready(Arc<dyn InferenceEngine>),
    Failed(String),
}

/// Load state of a [`LazyEngine`], for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum EngineStatus {
    Unloaded,
    Ready(String),
    Failed(String),
}

/// Lazily loaded, memoized inference engine.
///
/// The loader runs at most once until [`reload`](Self::reload) is called. A
/// failed load is remembered, so every later call is routed to the fallback
/// without retrying.
pub struct LazyEngine {
    loader: EngineLoader,
    state: Mutex<SlotState>,
}

impl LazyEngine {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn InferenceEngine>, EngineError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            state: Mutex::new(SlotState::Unloaded),
        }
    }

    /// Engine slot backed by ONNX models in `model_dir`.
    pub fn onnx(model_dir: PathBuf) -> Self {
        Self::new(move || {
            let engine: Arc<dyn InferenceEngine> = Arc::new(OnnxEngine::load(&model_dir)?);
            Ok(engine)
        })
    }

    /// Slot around an engine that is already constructed.
    pub fn ready(engine: Arc<dyn InferenceEngine>) -> Self {
        let reload_from = Arc::clone(&engine);
        Self {
            loader: Box::new(move || Ok(Arc::clone(&reload_from))),
            state: Mutex::new(SlotState::Ready(engine)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the engine, loading it on first use.
    pub fn get(&self) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        let mut state = self.lock();
        match &*state {
            SlotState::Ready(engine) => Ok(Arc::clone(engine)),
            SlotState::Failed(reason) => Err(EngineError::Unavailable(reason.clone())),
            SlotState::Unloaded => match (self.loader)() {
                Ok(engine) => {
                    tracing::info!(engine = engine.name(), "inference engine loaded");
                    *state = SlotState::Ready(Arc::clone(&engine));
                    Ok(engine)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "inference engine failed to load; using deterministic fallback");
                    let reason = e.to_string();
                    *state = SlotState::Failed(reason.clone());
                    Err(EngineError::Unavailable(reason))
                }
            },
        }
    }

    /// Forget the current engine (or failure) so the next call loads again.
    pub fn reload(&self) {
        tracing::info!("inference engine reload requested");
        *self.lock() = SlotState::Unloaded;
    }

    /// Pin the slot to a failure, e.g. after the engine fails certification.
    pub fn disable(&self, reason: impl Into<String>) {
        *self.lock() = SlotState::Failed(reason.into());
    }

    pub fn status(&self) -> EngineStatus {
        match &*self.lock() {
            SlotState::Unloaded => EngineStatus::Unloaded,
            SlotState::Ready(engine) => EngineStatus::Ready(engine.name().to_string()),
            SlotState::Failed(reason) => EngineStatus::Failed(reason.clone()),
        }
    }
}
