//! recalld: face recall daemon.
//!
//! Enrollment, one-shot identification over HTTP and live identification
//! over a WebSocket, all scoped per owner.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod media;
pub mod pipeline;
pub mod store;

pub use cache::{CacheKey, ResultCache};
pub use config::Config;
pub use engine::{spawn_engine, EngineHandle, Identification};
pub use error::EngineError;
pub use http::{build_router, AppState};
pub use identity::{IdentityVerifier, Owner};
pub use lifecycle::ExtractorLifecycle;
pub use media::MediaStore;
pub use pipeline::Recognition;
pub use store::{FaceStore, StoreError};
