use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Failures of the recognition pipeline.
///
/// `Clone` so a single failed model load can be handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("face models could not be loaded: {0}")]
    ModelLoad(String),
    #[error("embedding extraction failed: {0}")]
    Extraction(String),
    #[error("recognition exceeded {0:?}")]
    Timeout(Duration),
    #[error("engine worker pool exited")]
    ChannelClosed,
    #[error("failed to start engine worker: {0}")]
    WorkerSpawn(String),
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Text suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Extraction(e) => format!("Error processing image: {e}"),
            EngineError::Timeout(_) => {
                "Face recognition timed out, please try again".to_string()
            }
            EngineError::ModelLoad(_)
            | EngineError::ChannelClosed
            | EngineError::WorkerSpawn(_)
            | EngineError::Store(_) => "Face recognition is temporarily unavailable".to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e.to_string())
    }
}
