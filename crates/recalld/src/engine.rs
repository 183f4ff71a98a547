use recall_core::{Embedding, EmbeddingExtractor, EmbeddingRecord, MatchEngine, ProbeResult};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;

/// Outcome of identifying one image against an owner's registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    /// The extractor found no face in the image.
    NoFaceDetected,
    /// The owner has no enrolled face with an embedding.
    NoRegisteredFaces,
    /// One entry per face that matched; may be empty.
    Matches(Vec<ProbeResult>),
}

/// Work sent to the engine threads.
enum EngineRequest {
    Identify {
        extractor: Arc<dyn EmbeddingExtractor>,
        owner_id: String,
        image: Vec<u8>,
        registry: Vec<EmbeddingRecord>,
        threshold: f32,
        reply: oneshot::Sender<Result<Identification, EngineError>>,
    },
    Extract {
        extractor: Arc<dyn EmbeddingExtractor>,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Embedding>, EngineError>>,
    },
}

/// Clone-safe handle to the engine worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Extract probe embeddings and compare them against `registry`.
    pub async fn identify(
        &self,
        extractor: Arc<dyn EmbeddingExtractor>,
        owner_id: &str,
        image: Vec<u8>,
        registry: Vec<EmbeddingRecord>,
        threshold: f32,
    ) -> Result<Identification, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify {
                extractor,
                owner_id: owner_id.to_string(),
                image,
                registry,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Extract embeddings only (enrollment).
    pub async fn extract(
        &self,
        extractor: Arc<dyn EmbeddingExtractor>,
        image: Vec<u8>,
    ) -> Result<Vec<Embedding>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                extractor,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn `workers` OS threads draining a shared bounded queue.
///
/// The threads exit once every [`EngineHandle`] has been dropped.
pub fn spawn_engine(workers: usize, queue_depth: usize) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    for id in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("recall-engine-{id}"))
            .spawn(move || worker_loop(id, rx))
            .map_err(|e| EngineError::WorkerSpawn(e.to_string()))?;
    }
    tracing::info!(workers, queue_depth, "engine worker pool started");

    Ok(EngineHandle { tx })
}

fn worker_loop(id: usize, rx: Arc<Mutex<mpsc::Receiver<EngineRequest>>>) {
    tracing::debug!(worker = id, "engine thread started");
    loop {
        // Only one idle worker waits on the queue at a time; the rest wait on the lock.
        let next = match rx.lock() {
            Ok(mut guard) => guard.blocking_recv(),
            Err(poisoned) => poisoned.into_inner().blocking_recv(),
        };
        let Some(req) = next else { break };

        match req {
            EngineRequest::Identify {
                extractor,
                owner_id,
                image,
                registry,
                threshold,
                reply,
            } => {
                if reply.is_closed() {
                    tracing::debug!(worker = id, owner = %owner_id, "caller gone, frame skipped");
                    continue;
                }
                let result = guarded(|| {
                    run_identify(extractor.as_ref(), &owner_id, &image, &registry, threshold)
                });
                let _ = reply.send(result);
            }
            EngineRequest::Extract {
                extractor,
                image,
                reply,
            } => {
                if reply.is_closed() {
                    continue;
                }
                let result = guarded(|| {
                    extractor
                        .extract(&image)
                        .map_err(|e| EngineError::Extraction(e.to_string()))
                });
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(worker = id, "engine thread exiting");
}

/// Run `f`, turning a panic inside the extractor into an extraction error so
/// the worker thread survives.
fn guarded<T>(f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!("extractor panicked");
        Err(EngineError::Extraction("extractor panicked".into()))
    })
}

fn run_identify(
    extractor: &dyn EmbeddingExtractor,
    owner_id: &str,
    image: &[u8],
    registry: &[EmbeddingRecord],
    threshold: f32,
) -> Result<Identification, EngineError> {
    let probes = extractor
        .extract(image)
        .map_err(|e| EngineError::Extraction(e.to_string()))?;

    if probes.is_empty() {
        return Ok(Identification::NoFaceDetected);
    }
    if registry.iter().all(|r| r.embedding.is_none()) {
        return Ok(Identification::NoRegisteredFaces);
    }

    let engine = MatchEngine::new(extractor.metric()).with_threshold(threshold);
    Ok(Identification::Matches(engine.compare(owner_id, &probes, registry)))
}
