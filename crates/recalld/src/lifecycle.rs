//! Lazy, shared ownership of the (expensive) embedding extractor.
//!
//! State machine: `Unloaded → Loading → Loaded → (idle) → Unloaded`.
//! The state mutex is held only for transitions, never across the load itself
//! or across extraction.

use futures::future::{BoxFuture, FutureExt, Shared};
use recall_core::{EmbeddingExtractor, ExtractorLoader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::EngineError;

type LoadResult = Result<Arc<dyn EmbeddingExtractor>, EngineError>;
type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

enum State {
    Unloaded,
    /// `generation` identifies this load so a stale waiter cannot overwrite
    /// the outcome of a newer one.
    Loading {
        generation: u64,
        load: LoadFuture,
    },
    Loaded {
        extractor: Arc<dyn EmbeddingExtractor>,
        last_used: Instant,
    },
}

struct Inner {
    state: State,
    generation: u64,
}

pub struct ExtractorLifecycle {
    loader: Arc<dyn ExtractorLoader>,
    idle_timeout: Duration,
    inner: Mutex<Inner>,
    loads_started: AtomicUsize,
}

impl ExtractorLifecycle {
    /// `idle_timeout` of zero keeps the extractor loaded forever.
    pub fn new(loader: Arc<dyn ExtractorLoader>, idle_timeout: Duration) -> Self {
        Self {
            loader,
            idle_timeout,
            inner: Mutex::new(Inner {
                state: State::Unloaded,
                generation: 0,
            }),
            loads_started: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Transitions never panic mid-update, so a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return the ready extractor, loading it first if needed.
    ///
    /// Concurrent callers share one in-flight load. A failed load is reported
    /// to every waiter and leaves the state `Unloaded` so a later call retries.
    pub async fn ensure_loaded(&self) -> LoadResult {
        let (generation, load) = {
            let mut inner = self.lock();
            self.expire_locked(&mut inner);

            let in_flight = match &inner.state {
                State::Loaded { extractor, .. } => return Ok(Arc::clone(extractor)),
                State::Loading { generation, load } => Some((*generation, load.clone())),
                State::Unloaded => None,
            };

            match in_flight {
                Some(pending) => pending,
                None => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let load = self.start_load();
                    inner.state = State::Loading {
                        generation,
                        load: load.clone(),
                    };
                    (generation, load)
                }
            }
        };

        let result = load.await;

        let mut inner = self.lock();
        let current = matches!(
            &inner.state,
            State::Loading { generation: g, .. } if *g == generation
        );
        if current {
            inner.state = match &result {
                Ok(extractor) => State::Loaded {
                    extractor: Arc::clone(extractor),
                    last_used: Instant::now(),
                },
                Err(_) => State::Unloaded,
            };
        }
        result
    }

    fn start_load(&self) -> LoadFuture {
        self.loads_started.fetch_add(1, Ordering::SeqCst);
        let loader = Arc::clone(&self.loader);

        async move {
            let started = Instant::now();
            tracing::info!("loading face models");

            let result = match tokio::task::spawn_blocking(move || loader.load()).await {
                Ok(Ok(extractor)) => Ok(extractor),
                Ok(Err(e)) => Err(EngineError::ModelLoad(e.to_string())),
                Err(e) => Err(EngineError::ModelLoad(format!("load task failed: {e}"))),
            };

            match &result {
                Ok(_) => tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "face models loaded"
                ),
                Err(e) => tracing::warn!(error = %e, "face model load failed"),
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Mark the extractor as used now, postponing idle expiry.
    pub fn record_use(&self) {
        if let State::Loaded { last_used, .. } = &mut self.lock().state {
            *last_used = Instant::now();
        }
    }

    /// Unload if idle past the timeout. Returns whether an unload happened.
    ///
    /// Callers already holding the extractor keep it alive until they finish.
    pub fn expire_idle(&self) -> bool {
        let mut inner = self.lock();
        self.expire_locked(&mut inner)
    }

    fn expire_locked(&self, inner: &mut Inner) -> bool {
        if self.idle_timeout.is_zero() {
            return false;
        }
        let idle = match &inner.state {
            State::Loaded { last_used, .. } => last_used.elapsed(),
            _ => return false,
        };
        if idle < self.idle_timeout {
            return false;
        }
        inner.state = State::Unloaded;
        tracing::info!(idle_secs = idle.as_secs(), "face models unloaded after idle timeout");
        true
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.lock().state, State::Loaded { .. })
    }

    /// Number of load sequences started since construction.
    pub fn loads_started(&self) -> usize {
        self.loads_started.load(Ordering::SeqCst)
    }
}
