use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use faceprint_core::snapshot::{CaptureStep, FaceDetectionSnapshot};
use faceprint_service::{FaceprintService, ServiceConfig, ServiceError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faceprint", about = "Face enrollment and verification CLI")]
struct Cli {
    /// TOML config file (overrides FACEPRINT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use deterministic embeddings only; never load the inference engine
    #[arg(long, global = true)]
    no_engine: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Source image plus the detector snapshot for the face in it.
#[derive(Args)]
struct Capture {
    /// Image file (PNG, JPEG, ...)
    #[arg(short, long)]
    image: PathBuf,
    /// Detection snapshot as JSON
    #[arg(short, long)]
    snapshot: PathBuf,
    /// Capture step the user was asked to perform
    #[arg(long, default_value = "center")]
    step: CaptureStep,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a capture and show the quality gate decision
    Quality(Capture),
    /// Enroll a capture as the reference for an identity
    Enroll {
        identity: String,
        #[command(flatten)]
        capture: Capture,
    },
    /// Verify a capture against an enrolled identity
    Verify {
        identity: String,
        #[command(flatten)]
        capture: Capture,
    },
    /// Find the enrolled identity that best matches a capture
    Identify(Capture),
    /// Remove an enrolled identity
    Remove { identity: String },
    /// List enrolled identities
    List,
    /// Validate the inference engine's models
    Validate,
    /// Show service status
    Status,
}

struct LoadedCapture {
    image: Arc<[u8]>,
    snapshot: FaceDetectionSnapshot,
    step: CaptureStep,
}

fn load_capture(capture: &Capture) -> Result<LoadedCapture> {
    let image = std::fs::read(&capture.image)
        .with_context(|| format!("failed to read image {}", capture.image.display()))?;
    let snapshot = read_snapshot(&capture.snapshot)?;
    Ok(LoadedCapture {
        image: image.into(),
        snapshot,
        step: capture.step,
    })
}

fn read_snapshot(path: &Path) -> Result<FaceDetectionSnapshot> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read snapshot {}", path.display()))?;
    FaceDetectionSnapshot::from_json(&raw).with_context(|| format!("invalid snapshot {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::from_file(path)?.with_env_overrides(),
        None => ServiceConfig::load()?,
    };
    if cli.no_engine {
        config.engine_enabled = false;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(e) = &result {
        if let Some(ServiceError::QualityRejected { recommendations, .. }) = e.downcast_ref::<ServiceError>() {
            for hint in recommendations {
                eprintln!("hint: {hint}");
            }
        }
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    tracing::debug!(?config, "configuration loaded");
    let service = FaceprintService::open(config).await?;

    match cli.command {
        Commands::Quality(capture) => {
            let c = load_capture(&capture)?;
            let analysis = service.analyze_capture(c.image, &c.snapshot, c.step).await?;
            let accepted = service.gate(&analysis).is_accept();
            print_json(&serde_json::json!({ "accepted": accepted, "analysis": analysis }))?;
        }
        Commands::Enroll { identity, capture } => {
            let c = load_capture(&capture)?;
            let captured = service.enroll_capture(&identity, c.image, &c.snapshot, c.step).await?;
            print_json(&serde_json::json!({
                "identity": identity,
                "overall": captured.analysis.overall,
                "model_version": captured.embedding.model_version,
            }))?;
        }
        Commands::Verify { identity, capture } => {
            let c = load_capture(&capture)?;
            match service.verify_capture(&identity, c.image, &c.snapshot, c.step).await {
                Ok(result) => {
                    print_json(&result)?;
                    if !result.matched {
                        std::process::exit(1);
                    }
                }
                Err(e) if e.is_not_found() => anyhow::bail!("identity '{identity}' is not enrolled"),
                Err(e) if e.is_model_mismatch() => anyhow::bail!("{e}"),
                Err(e) if e.is_integrity_failure() => {
                    anyhow::bail!("stored reference for '{identity}' failed its integrity check; re-enroll explicitly after investigating")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Identify(capture) => {
            let c = load_capture(&capture)?;
            let captured = service.capture(c.image, &c.snapshot, c.step).await?;
            match service.identify(&captured.embedding)? {
                Some((identity, result)) => {
                    print_json(&serde_json::json!({ "identity": identity, "result": result }))?
                }
                None => println!("No enrolled identities from model {:?}", captured.embedding.model_version),
            }
        }
        Commands::Remove { identity } => {
            if service.remove(&identity)? {
                println!("Removed {identity}");
            } else {
                println!("{identity} was not enrolled");
            }
        }
        Commands::List => {
            let identities = service.identities()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            } else {
                print_json(&identities)?;
            }
        }
        Commands::Validate => {
            let report = service.validate_models().await;
            print_json(&report)?;
            if !report.overall {
                std::process::exit(1);
            }
        }
        Commands::Status => print_json(&service.status()?)?,
    }

    Ok(())
}
