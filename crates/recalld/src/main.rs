use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recall_core::OnnxLoader;
use recalld::{
    http, spawn_engine, AppState, Config, ExtractorLifecycle, FaceStore, MediaStore, Recognition,
    ResultCache,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recalld", about = "Recall face identification daemon")]
struct Args {
    /// Config file (TOML). Falls back to $RECALL_CONFIG.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address (e.g. 127.0.0.1:8000)
    #[arg(short, long)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Register an API token for an owner, then exit
    AddUser {
        token: String,
        /// Owner identifier faces are stored under
        #[arg(long)]
        owner: String,
        /// Name shown when the owner connects
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var_os("RECALL_CONFIG").map(PathBuf::from));
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    let store = FaceStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    if let Some(Command::AddUser { token, owner, name }) = args.command {
        store.add_user(&token, &owner, &name).await?;
        println!("Registered token for {owner} ({name})");
        return Ok(());
    }

    tracing::info!(
        listen = %config.listen_addr,
        models = %config.model_dir.display(),
        workers = config.workers,
        "recalld starting"
    );

    let loader = Arc::new(OnnxLoader::new(
        config.detector_model_path(),
        config.recognizer_model_path(),
    ));
    let lifecycle = Arc::new(ExtractorLifecycle::new(loader, config.idle_timeout));
    let engine = spawn_engine(config.workers, config.workers * 2)?;
    let cache = ResultCache::new(config.cache_ttl);
    let media = MediaStore::new(&config.media_dir);

    let recognition = Recognition::new(Arc::clone(&lifecycle), engine, store.clone(), cache, media)
        .with_threshold(config.match_threshold)
        .with_frame_timeout(config.frame_timeout);
    let state = Arc::new(AppState {
        recognition,
        verifier: Arc::new(store),
        stream_queue_depth: config.stream_queue_depth,
    });

    let reaper = spawn_reaper(Arc::clone(&state), config.idle_timeout);

    http::serve(state, &config.listen_addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    reaper.abort();
    tracing::info!("recalld stopped");
    Ok(())
}

/// Periodically unload idle models and drop expired cache entries.
fn spawn_reaper(state: Arc<AppState>, idle_timeout: Duration) -> tokio::task::JoinHandle<()> {
    let period = if idle_timeout.is_zero() {
        Duration::from_secs(60)
    } else {
        (idle_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            state.recognition.lifecycle().expire_idle();
            let purged = state.recognition.cache().purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "expired cache entries dropped");
            }
        }
    })
}
