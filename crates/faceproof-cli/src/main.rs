use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceproof_core::{
    best_index, AnalysisOptions, CancelToken, DeepfakeDetector, DetectionResult, InferenceBackend,
    Label, OrtBackend,
};
use image::RgbaImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod certify;
mod config;
mod engine;
mod source;

use config::Config;
use engine::EngineHandle;
use source::ImageSource;

#[derive(Parser)]
#[command(name = "faceproof", about = "Detect manipulated faces in images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the faces in one or more images as Real or Fake
    Analyze {
        /// Image file, http(s) URL, or `-` for stdin
        #[arg(required = true)]
        sources: Vec<String>,
        /// Report every face instead of only the most confident one
        #[arg(long)]
        all: bool,
        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
        /// Minimum detector score for a face box
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Padding added around each face, as a fraction of the box size
        #[arg(short = 'r', long)]
        extend_ratio: Option<f32>,
        /// Directory containing the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Classify faces in parallel
        #[arg(long)]
        parallel: bool,
        /// Mark image stamped onto images judged Real
        #[arg(long, requires = "certify_out")]
        certify_mark: Option<PathBuf>,
        /// Output directory for certified images
        #[arg(long, requires = "certify_mark")]
        certify_out: Option<PathBuf>,
    },
    /// Show which model files will be loaded
    Models {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

/// Per-source entry of the `--json` report.
#[derive(Serialize)]
struct Report {
    source: String,
    results: Vec<DetectionResult>,
    /// Index into `results` of the most confident entry.
    best: Option<usize>,
    certified: Option<PathBuf>,
}

struct Certify {
    mark: RgbaImage,
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        Commands::Analyze {
            sources,
            all,
            json,
            threshold,
            extend_ratio,
            model_dir,
            parallel,
            certify_mark,
            certify_out,
        } => {
            if let Some(dir) = model_dir {
                config.model_dir = dir;
            }
            if let Some(t) = threshold {
                config.pipeline.confidence_threshold = t;
            }
            if let Some(r) = extend_ratio {
                config.pipeline.extend_ratio = r;
            }
            let certify = match (certify_mark, certify_out) {
                (Some(mark), Some(out_dir)) => Some(Certify {
                    mark: certify::load_mark(&mark)
                        .with_context(|| format!("loading mark {}", mark.display()))?,
                    out_dir,
                }),
                _ => None,
            };
            analyze(&config, &sources, all, json, parallel, certify.as_ref()).await?;
        }
        Commands::Models { model_dir } => {
            if let Some(dir) = model_dir {
                config.model_dir = dir;
            }
            print_models(&config);
        }
    }

    Ok(())
}

async fn analyze(
    config: &Config,
    sources: &[String],
    all: bool,
    json: bool,
    parallel: bool,
    certify: Option<&Certify>,
) -> Result<()> {
    let backend: Arc<dyn InferenceBackend> = Arc::new(OrtBackend::new(config.intra_threads));
    let detector = DeepfakeDetector::load(
        Arc::clone(&backend),
        &config.detector_model_path(),
        &config.classifier_model_path(),
        config.pipeline.clone(),
    )
    .context("loading models")?;
    tracing::info!(
        detector = %config.detector_model_path(),
        classifier = %config.classifier_model_path(),
        "models loaded"
    );
    let options = detector.default_options().parallel(parallel);
    let engine = engine::spawn_engine(backend, detector)?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted; cancelling analysis");
                cancel.cancel();
            }
        });
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;

    let mut reports = Vec::with_capacity(sources.len());
    let mut failures = 0usize;
    for arg in sources {
        if cancel.is_cancelled() {
            break;
        }
        match analyze_source(&engine, &client, arg, options, &cancel, all, certify).await {
            Ok(report) => {
                if !json {
                    print_report(&report);
                }
                reports.push(report);
            }
            Err(e) => {
                tracing::error!(source = %arg, error = %e, "analysis failed");
                failures += 1;
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} sources failed", sources.len());
    }
    Ok(())
}

async fn analyze_source(
    engine: &EngineHandle,
    client: &reqwest::Client,
    arg: &str,
    options: AnalysisOptions,
    cancel: &CancelToken,
    all: bool,
    certify: Option<&Certify>,
) -> Result<Report> {
    let source = ImageSource::from_arg(arg)?;
    let name = source.to_string();
    let stem = source.stem();
    let image = source.resolve(client).await?;
    tracing::debug!(source = %name, width = image.width(), height = image.height(), "image decoded");

    // The engine takes ownership; keep a copy only when it will be stamped.
    let original = certify.map(|_| image.clone());

    let results = if all {
        engine.analyze_all(image, options, cancel.clone()).await?
    } else {
        engine
            .analyze_best(image, options, cancel.clone())
            .await?
            .into_iter()
            .collect()
    };
    let best = best_index(&results);

    let certified = match (certify, original, best) {
        (Some(c), Some(original), Some(i)) if results[i].label == Label::Real => {
            Some(certify::save_certified(&original, &c.mark, &c.out_dir, &stem)?)
        }
        _ => None,
    };

    Ok(Report {
        source: name,
        results,
        best,
        certified,
    })
}

fn print_report(report: &Report) {
    println!("{}:", report.source);
    if report.results.is_empty() {
        println!("  no result");
    }
    for result in &report.results {
        println!("  {result}");
    }
    if let Some(path) = &report.certified {
        println!("  certified → {}", path.display());
    }
}

fn print_models(config: &Config) {
    println!("model dir: {}", config.model_dir.display());
    for (role, path) in [
        ("detector", config.detector_model_path()),
        ("classifier", config.classifier_model_path()),
    ] {
        let status = if Path::new(&path).exists() { "found" } else { "missing" };
        println!("  {role:<10} {path} ({status})");
    }
}
