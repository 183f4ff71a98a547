//! recall-core: face embedding extraction and registry matching.
//!
//! Extraction uses SCRFD for detection and ArcFace for recognition, both on
//! ONNX Runtime. Matching maps embedding distance to a 0–100 confidence and
//! accepts the best candidate at or above the threshold.

pub mod extractor;
pub mod matcher;
pub mod onnx;
pub mod signature;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractError, ExtractorLoader};
pub use matcher::{DistanceMetric, MatchEngine, DEFAULT_ACCEPT_THRESHOLD};
pub use onnx::{OnnxExtractor, OnnxLoader};
pub use signature::ContentSignature;
pub use types::{BoundingBox, Embedding, EmbeddingRecord, ProbeResult};

/// Default model directory used when none is configured.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/recall/models")
}
