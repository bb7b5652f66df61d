use faceprint_core::embedding::EmbeddingGenerator;
use faceprint_core::inference::EngineError;
use faceprint_core::preprocess::PreparedFace;
use faceprint_core::types::Embedding;
use faceprint_core::validator::{ModelValidationReport, ModelValidator};
use faceprint_core::ModelKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("inference thread exited")]
    ChannelClosed,
    #[error("failed to spawn inference thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from the service to the inference thread.
enum WorkerRequest {
    Embed {
        prepared: Box<PreparedFace>,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
    Validate {
        validator: ModelValidator,
        only: Option<ModelKind>,
        reply: oneshot::Sender<Result<ModelValidationReport, EngineError>>,
    },
}

/// Clone-safe handle to the inference thread.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    /// Run the engine strategy on `prepared`, bounded by `timeout`.
    ///
    /// A request that is still queued or running when the timeout expires is
    /// abandoned; its late reply is dropped.
    pub async fn embed(&self, prepared: PreparedFace, timeout: Duration) -> Result<Embedding, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = WorkerRequest::Embed {
            prepared: Box::new(prepared),
            reply: reply_tx,
        };

        let exchange = async {
            self.tx.send(request).await.map_err(|_| WorkerError::ChannelClosed)?;
            let reply = reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?;
            Ok::<_, WorkerError>(reply?)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| WorkerError::Engine(EngineError::TimedOut(timeout)))?
    }

    /// Validate the engine's models on the inference thread, bounded by `timeout`.
    ///
    /// `only` restricts the report to one sub-model.
    pub async fn validate(
        &self,
        validator: ModelValidator,
        only: Option<ModelKind>,
        timeout: Duration,
    ) -> Result<ModelValidationReport, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = WorkerRequest::Validate {
            validator,
            only,
            reply: reply_tx,
        };

        let exchange = async {
            self.tx.send(request).await.map_err(|_| WorkerError::ChannelClosed)?;
            let reply = reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?;
            Ok::<_, WorkerError>(reply?)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| WorkerError::Engine(EngineError::TimedOut(timeout)))?
    }
}

/// Spawn the inference thread around `generator`'s engine slot.
///
/// The engine is loaded lazily on the first request, so a missing model
/// directory never fails startup.
pub fn spawn_worker(generator: Arc<EmbeddingGenerator>) -> Result<WorkerHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(8);

    std::thread::Builder::new()
        .name("faceprint-inference".into())
        .spawn(move || {
            tracing::info!("inference thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    // Callers that timed out while queued have dropped their
                    // receiver; skip their work so it cannot delay fresh requests.
                    WorkerRequest::Embed { reply, .. } if reply.is_closed() => {
                        tracing::debug!("skipping abandoned embedding request");
                    }
                    WorkerRequest::Validate { reply, .. } if reply.is_closed() => {
                        tracing::debug!("skipping abandoned validation request");
                    }
                    WorkerRequest::Embed { prepared, reply } => {
                        let result = generator.engine_embedding(&prepared);
                        let _ = reply.send(result);
                    }
                    WorkerRequest::Validate { validator, only, reply } => {
                        let result = run_validate(&generator, &validator, only);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("inference thread exiting");
        })?;

    Ok(WorkerHandle { tx })
}

fn run_validate(
    generator: &EmbeddingGenerator,
    validator: &ModelValidator,
    only: Option<ModelKind>,
) -> Result<ModelValidationReport, EngineError> {
    let slot = generator
        .engine()
        .ok_or_else(|| EngineError::Unavailable("deterministic strategy selected".into()))?;
    let engine = slot.get()?;

    Ok(match only {
        None => validator.validate_all(engine.as_ref()),
        Some(kind) => {
            let check = validator.validate_model(engine.as_ref(), kind);
            let passed = check.passed;
            ModelValidationReport {
                engine: engine.name().to_string(),
                models: vec![check],
                pass_fraction: if passed { 1.0 } else { 0.0 },
                overall: passed,
            }
        }
    })
}
