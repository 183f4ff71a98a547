use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recall_core::matcher::confidence_from_distance;
use recall_core::{
    EmbeddingExtractor, EmbeddingRecord, ExtractorLoader, MatchEngine, OnnxLoader,
    DEFAULT_ACCEPT_THRESHOLD,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "recall", about = "Recall face extraction and matching diagnostics")]
struct Cli {
    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image and report their embeddings
    Inspect { image: PathBuf },
    /// Match the faces in a probe image against enrolled images
    Compare {
        probe: PathBuf,
        /// Enrolled images; the person name is the file stem
        #[arg(required = true)]
        enrolled: Vec<PathBuf>,
        /// Minimum confidence (0-100) for a match
        #[arg(long, default_value_t = DEFAULT_ACCEPT_THRESHOLD)]
        threshold: f32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let model_dir = cli
        .model_dir
        .or_else(|| std::env::var_os("RECALL_MODEL_DIR").map(PathBuf::from))
        .unwrap_or_else(recall_core::default_model_dir);

    let extractor = OnnxLoader::from_model_dir(&model_dir)
        .load()
        .with_context(|| format!("loading models from {}", model_dir.display()))?;

    match cli.command {
        Commands::Inspect { image } => inspect(extractor.as_ref(), &image, cli.json),
        Commands::Compare {
            probe,
            enrolled,
            threshold,
        } => compare(extractor, &probe, &enrolled, threshold, cli.json),
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn inspect(extractor: &dyn EmbeddingExtractor, image: &Path, as_json: bool) -> Result<()> {
    let embeddings = extractor.extract(&read_image(image)?)?;

    if as_json {
        let faces: Vec<_> = embeddings
            .iter()
            .map(|e| {
                let norm = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
                json!({ "dimension": e.values.len(), "norm": norm })
            })
            .collect();
        println!("{}", json!({ "image": image.display().to_string(), "faces": faces }));
        return Ok(());
    }

    println!("{}: {} face(s)", image.display(), embeddings.len());
    for (i, e) in embeddings.iter().enumerate() {
        let preview: Vec<String> = e.values.iter().take(4).map(|v| format!("{v:+.4}")).collect();
        println!("  face {i}: {}-d [{} ...]", e.values.len(), preview.join(", "));
    }
    Ok(())
}

fn compare(
    extractor: Arc<dyn EmbeddingExtractor>,
    probe: &Path,
    enrolled: &[PathBuf],
    threshold: f32,
    as_json: bool,
) -> Result<()> {
    let mut registry = Vec::with_capacity(enrolled.len());
    for path in enrolled {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let embedding = extractor.extract(&read_image(path)?)?.into_iter().next();
        if embedding.is_none() {
            eprintln!("warning: no face found in {}", path.display());
        }
        registry.push(EmbeddingRecord {
            id: name.clone(),
            owner_id: "cli".into(),
            person_name: name,
            embedding,
            image_path: Some(path.display().to_string()),
            enrolled_at: chrono::Utc::now(),
        });
    }

    let probes = extractor.extract(&read_image(probe)?)?;
    if probes.is_empty() {
        bail!("no face detected in {}", probe.display());
    }

    let metric = extractor.metric();
    let engine = MatchEngine::new(metric).with_threshold(threshold);
    let matches = engine.compare("cli", &probes, &registry);

    if as_json {
        let scores: Vec<_> = probes
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let per_record: Vec<_> = registry
                    .iter()
                    .filter_map(|r| {
                        let e = r.embedding.as_ref()?;
                        Some(json!({
                            "person_name": r.person_name,
                            "confidence": confidence_from_distance(metric.distance(p, e)),
                        }))
                    })
                    .collect();
                json!({ "face": i, "scores": per_record })
            })
            .collect();
        let identified: Vec<_> = matches
            .iter()
            .map(|m| json!({ "person_name": m.person_name, "confidence": m.confidence_label() }))
            .collect();
        println!("{}", json!({ "faces": scores, "identified_people": identified }));
        return Ok(());
    }

    for (i, p) in probes.iter().enumerate() {
        println!("face {i}:");
        for r in &registry {
            if let Some(e) = r.embedding.as_ref() {
                let confidence = confidence_from_distance(metric.distance(p, e));
                println!("  {:<24} {confidence:6.2}%", r.person_name);
            }
        }
    }
    if matches.is_empty() {
        println!("no match at or above {threshold:.2}%");
    } else {
        for m in &matches {
            println!("match: {} ({})", m.person_name, m.confidence_label());
        }
    }
    Ok(())
}
