//! Recognition pipeline shared by the HTTP and WebSocket front ends.
//!
//! identify: cache → ensure model → registry → worker pool → cache.
//! enroll:   save image → ensure model → extract → upsert → invalidate cache.

use recall_core::{ContentSignature, EmbeddingRecord};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheKey, ResultCache};
use crate::engine::{EngineHandle, Identification};
use crate::error::EngineError;
use crate::lifecycle::ExtractorLifecycle;
use crate::media::MediaStore;
use crate::store::FaceStore;

/// Result of one enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub record: EmbeddingRecord,
    pub face_detected: bool,
}

pub struct Recognition {
    lifecycle: Arc<ExtractorLifecycle>,
    engine: EngineHandle,
    store: FaceStore,
    cache: ResultCache,
    media: MediaStore,
    threshold: f32,
    frame_timeout: Duration,
}

impl Recognition {
    pub fn new(
        lifecycle: Arc<ExtractorLifecycle>,
        engine: EngineHandle,
        store: FaceStore,
        cache: ResultCache,
        media: MediaStore,
    ) -> Self {
        Self {
            lifecycle,
            engine,
            store,
            cache,
            media,
            threshold: recall_core::DEFAULT_ACCEPT_THRESHOLD,
            frame_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_frame_timeout(mut self, frame_timeout: Duration) -> Self {
        self.frame_timeout = frame_timeout;
        self
    }

    pub fn lifecycle(&self) -> &Arc<ExtractorLifecycle> {
        &self.lifecycle
    }

    pub fn store(&self) -> &FaceStore {
        &self.store
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Identify the faces in `image` against `owner_id`'s registry.
    ///
    /// Byte-identical images for the same owner are answered from the cache
    /// until the entry expires or the owner's registry changes. A result
    /// computed while the registry changed is returned but not cached.
    pub async fn identify(&self, owner_id: &str, image: Vec<u8>) -> Result<Identification, EngineError> {
        let signature = ContentSignature::compute(&image);
        let key = CacheKey::new(owner_id, signature);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(owner = owner_id, signature = %key.signature, "result cache hit");
            return Ok(hit);
        }

        // Taken before the registry read: an enrollment or deletion that lands
        // while this frame is in flight must keep its result out of the cache.
        let generation = self.cache.generation(owner_id);
        let started = Instant::now();
        let outcome = self
            .bounded(async {
                let extractor = self.lifecycle.ensure_loaded().await?;
                let registry = self.store.registry(owner_id).await?;
                self.engine
                    .identify(extractor, owner_id, image, registry, self.threshold)
                    .await
            })
            .await?;
        self.lifecycle.record_use();

        tracing::debug!(
            owner = owner_id,
            signature = %key.signature,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "frame identified"
        );
        self.cache.put_if_current(key, outcome.clone(), generation);
        Ok(outcome)
    }

    /// Store `image` under `person_name`, replacing any earlier enrollment.
    ///
    /// An image without a detectable face is still stored, with no embedding.
    pub async fn enroll(
        &self,
        owner_id: &str,
        person_name: &str,
        filename: &str,
        image: Vec<u8>,
    ) -> Result<Enrollment, EngineError> {
        let path = self
            .media
            .save(owner_id, filename, &image)
            .await
            .map_err(|e| EngineError::Store(format!("saving image: {e}")))?;

        let extracted = self
            .bounded(async {
                let extractor = self.lifecycle.ensure_loaded().await?;
                self.engine.extract(extractor, image).await
            })
            .await;
        let embeddings = match extracted {
            Ok(embeddings) => embeddings,
            Err(e) => {
                self.discard(&path).await;
                return Err(e);
            }
        };
        self.lifecycle.record_use();

        let path_str = path.to_string_lossy().into_owned();
        let stored = self
            .store
            .upsert(owner_id, person_name, embeddings.first(), Some(&path_str))
            .await;
        let (record, previous) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                self.discard(&path).await;
                return Err(e.into());
            }
        };

        if let Some(previous) = previous.filter(|p| *p != path_str) {
            self.discard(Path::new(&previous)).await;
        }
        self.cache.invalidate_owner(owner_id);

        Ok(Enrollment {
            face_detected: record.embedding.is_some(),
            record,
        })
    }

    /// Delete an enrollment and its image. Returns whether it existed.
    pub async fn delete(&self, owner_id: &str, person_name: &str) -> Result<bool, EngineError> {
        let Some(image_path) = self.store.delete(owner_id, person_name).await? else {
            return Ok(false);
        };
        if let Some(path) = image_path {
            self.discard(&PathBuf::from(path)).await;
        }
        self.cache.invalidate_owner(owner_id);
        Ok(true)
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<EmbeddingRecord>, EngineError> {
        Ok(self.store.list(owner_id).await?)
    }

    async fn bounded<T>(
        &self,
        work: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.frame_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms = self.frame_timeout.as_millis() as u64, "recognition timed out");
                Err(EngineError::Timeout(self.frame_timeout))
            }
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = self.media.remove(path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove image");
        }
    }
}
