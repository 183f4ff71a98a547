//! The face-embedding capability the rest of the system is written against.

use crate::matcher::DistanceMetric;
use crate::types::Embedding;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces zero or more face embeddings from an encoded image.
///
/// Implementations must be callable from several worker threads at once;
/// any model state that is not reentrant is serialised internally.
pub trait EmbeddingExtractor: Send + Sync {
    /// One embedding per detected face, in detection order. An image with no
    /// face yields an empty vector, not an error.
    fn extract(&self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError>;

    /// Distance metric the produced embeddings are meant to be compared with.
    fn metric(&self) -> DistanceMetric;
}

/// Performs the expensive construction of an extractor.
pub trait ExtractorLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn EmbeddingExtractor>, ExtractError>;
}
