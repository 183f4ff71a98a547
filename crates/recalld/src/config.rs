use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Resolved from an optional TOML file, then `RECALL_*` environment variables,
/// then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address the HTTP/WebSocket server binds to.
    pub listen_addr: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root directory for enrollment images.
    pub media_dir: PathBuf,
    /// Unload the models after this long without use. Zero disables expiry.
    pub idle_timeout: Duration,
    /// How long an identification result stays cached.
    pub cache_ttl: Duration,
    /// Upper bound on one frame's recognition, model load included.
    pub frame_timeout: Duration,
    /// Number of recognition worker threads.
    pub workers: usize,
    /// Minimum confidence (0–100) for a match.
    pub match_threshold: f32,
    /// Frames a stream connection may have queued before new ones are dropped.
    pub stream_queue_depth: usize,
}

/// On-disk shape of the config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen_addr: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub media_dir: Option<PathBuf>,
    pub idle_timeout_secs: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub frame_timeout_secs: Option<u64>,
    pub workers: Option<usize>,
    pub match_threshold: Option<f32>,
    pub stream_queue_depth: Option<usize>,
}

impl Config {
    /// Load from `path` (if given) with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.display().to_string(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: p.display().to_string(),
                    source,
                })?
            }
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge file values with an environment lookup. Environment wins.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("recall");

        let secs = |key: &str, file_value: Option<u64>, default: u64| {
            Duration::from_secs(env_parsed(&env, key).or(file_value).unwrap_or(default))
        };

        Self {
            listen_addr: env("RECALL_LISTEN_ADDR")
                .or(file.listen_addr)
                .unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            model_dir: env("RECALL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(recall_core::default_model_dir),
            db_path: env("RECALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("recall.db")),
            media_dir: env("RECALL_MEDIA_DIR")
                .map(PathBuf::from)
                .or(file.media_dir)
                .unwrap_or_else(|| data_dir.join("media")),
            idle_timeout: secs("RECALL_IDLE_TIMEOUT_SECS", file.idle_timeout_secs, 300),
            cache_ttl: secs("RECALL_CACHE_TTL_SECS", file.cache_ttl_secs, 60),
            frame_timeout: secs("RECALL_FRAME_TIMEOUT_SECS", file.frame_timeout_secs, 10),
            workers: env_parsed(&env, "RECALL_WORKERS")
                .or(file.workers)
                .unwrap_or_else(num_cpus::get)
                .max(1),
            match_threshold: env_parsed(&env, "RECALL_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(recall_core::DEFAULT_ACCEPT_THRESHOLD),
            stream_queue_depth: env_parsed(&env, "RECALL_STREAM_QUEUE_DEPTH")
                .or(file.stream_queue_depth)
                .unwrap_or(4)
                .max(1),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn env_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = env(key)?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring unparseable environment value");
            None
        }
    }
}
