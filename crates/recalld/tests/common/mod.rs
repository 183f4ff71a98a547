//! Shared fixtures: a text-driven stub extractor and a fully wired state.
#![allow(dead_code)]

use recall_core::{DistanceMetric, Embedding, EmbeddingExtractor, ExtractError, ExtractorLoader};
use recalld::{
    spawn_engine, AppState, ExtractorLifecycle, FaceStore, MediaStore, Recognition, ResultCache,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TOKEN: &str = "tok-u1";
pub const OWNER: &str = "u1";
pub const SLOW_EXTRACTION: Duration = Duration::from_millis(300);

/// Treats the image bytes as text: comma-separated floats, one 1-d embedding
/// each. `noface` yields no embeddings; anything unparseable is a decode error.
/// A `slow:` prefix makes the extraction take [`SLOW_EXTRACTION`].
pub struct TextExtractor {
    pub calls: Arc<AtomicUsize>,
}

impl EmbeddingExtractor for TextExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut text = std::str::from_utf8(image).map_err(|e| ExtractError::Decode(e.to_string()))?;
        if let Some(rest) = text.strip_prefix("slow:") {
            std::thread::sleep(SLOW_EXTRACTION);
            text = rest;
        }
        if text == "noface" {
            return Ok(Vec::new());
        }
        text.split(',')
            .map(|s| {
                s.trim()
                    .parse::<f32>()
                    .map(|v| Embedding::new(vec![v]))
                    .map_err(|e| ExtractError::Decode(e.to_string()))
            })
            .collect()
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Euclidean
    }
}

pub struct StubLoader {
    pub loads: AtomicUsize,
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl ExtractorLoader for StubLoader {
    fn load(&self) -> Result<Arc<dyn EmbeddingExtractor>, ExtractError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(Arc::new(TextExtractor {
            calls: Arc::clone(&self.calls),
        }))
    }
}

pub struct Options {
    pub cache_ttl: Duration,
    pub frame_timeout: Duration,
    pub load_delay: Duration,
    pub queue_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            frame_timeout: Duration::from_secs(5),
            load_delay: Duration::ZERO,
            queue_depth: 4,
        }
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub loader: Arc<StubLoader>,
    pub media: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(Options::default()).await
    }

    pub async fn with_options(opts: Options) -> Self {
        let media = tempfile::tempdir().unwrap();
        let store = FaceStore::open_in_memory().await.unwrap();
        store.add_user(TOKEN, OWNER, "Dana").await.unwrap();

        let loader = Arc::new(StubLoader {
            loads: AtomicUsize::new(0),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: opts.load_delay,
        });
        let lifecycle = Arc::new(ExtractorLifecycle::new(loader.clone(), Duration::ZERO));
        let engine = spawn_engine(2, 8).unwrap();
        let recognition = Recognition::new(
            lifecycle,
            engine,
            store.clone(),
            ResultCache::new(opts.cache_ttl),
            MediaStore::new(media.path()),
        )
        .with_frame_timeout(opts.frame_timeout);

        let state = Arc::new(AppState {
            recognition,
            verifier: Arc::new(store),
            stream_queue_depth: opts.queue_depth,
        });
        Self {
            state,
            loader,
            media,
        }
    }

    /// Enroll Alice at 0.15 and Bob at 0.6 for the test owner.
    pub async fn with_alice_and_bob(self) -> Self {
        for (name, image) in [("Alice", "0.15"), ("Bob", "0.6")] {
            self.state
                .recognition
                .enroll(OWNER, name, &format!("{name}.jpg"), image.as_bytes().to_vec())
                .await
                .unwrap();
        }
        self
    }

    pub fn extractions(&self) -> usize {
        self.loader.calls.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loader.loads.load(Ordering::SeqCst)
    }

    /// Number of files under the media root.
    pub fn stored_files(&self) -> usize {
        fn walk(dir: &std::path::Path) -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .map(|e| {
                            let path = e.path();
                            if path.is_dir() {
                                walk(&path)
                            } else {
                                1
                            }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        walk(self.media.path())
    }
}
