//! ONNX implementation of [`EmbeddingExtractor`]: SCRFD detection, alignment,
//! ArcFace recognition.

mod alignment;
pub mod detector;
pub mod recognizer;

pub use detector::FaceDetector;
pub use recognizer::FaceRecognizer;

use crate::extractor::{EmbeddingExtractor, ExtractError, ExtractorLoader};
use crate::matcher::DistanceMetric;
use crate::types::Embedding;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub(crate) fn session_error(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::Inference(format!("session setup: {e}"))
}

/// Detector + recognizer pair. Each ONNX session sits behind its own mutex,
/// so concurrent callers are serialised per model.
pub struct OnnxExtractor {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxExtractor {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        }
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
        let img = image::load_from_memory(image)
            .map_err(|e| ExtractError::Decode(e.to_string()))?
            .to_rgb8();

        let faces = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|e| ExtractError::Inference(format!("detector lock poisoned: {e}")))?;
            detector.detect(&img)?
        };
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|e| ExtractError::Inference(format!("recognizer lock poisoned: {e}")))?;

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in &faces {
            if let Some(embedding) = recognizer.extract(&img, face)? {
                embeddings.push(embedding);
            }
        }

        tracing::debug!(
            width = img.width(),
            height = img.height(),
            faces = faces.len(),
            embeddings = embeddings.len(),
            "extracted face embeddings"
        );
        Ok(embeddings)
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Angular
    }
}

/// Loads the SCRFD and ArcFace models from disk on demand.
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
}

impl OnnxLoader {
    pub fn new(detector_path: impl Into<PathBuf>, recognizer_path: impl Into<PathBuf>) -> Self {
        Self {
            detector_path: detector_path.into(),
            recognizer_path: recognizer_path.into(),
        }
    }

    /// Standard model file names (`det_10g.onnx`, `w600k_r50.onnx`) under `dir`.
    pub fn from_model_dir(dir: &Path) -> Self {
        Self::new(dir.join("det_10g.onnx"), dir.join("w600k_r50.onnx"))
    }
}

impl ExtractorLoader for OnnxLoader {
    fn load(&self) -> Result<Arc<dyn EmbeddingExtractor>, ExtractError> {
        let detector = FaceDetector::load(&self.detector_path)?;
        let recognizer = FaceRecognizer::load(&self.recognizer_path)?;
        Ok(Arc::new(OnnxExtractor::new(detector, recognizer)))
    }
}
