use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate::{Config, Verifier};
use facegate_core::FaceDescriptor;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", version, about = "facegate face verification CLI")]
struct Cli {
    /// TOML config file; FACEGATE_* environment variables still apply on top
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a reference photo against a candidate capture
    Verify {
        /// Reference image (raw image file or base64 text)
        reference: PathBuf,
        /// Candidate image (raw image file or base64 text)
        candidate: PathBuf,
    },
    /// Extract a face descriptor for enrollment and print it as JSON
    Enroll {
        image: PathBuf,
    },
    /// Compare a candidate capture against a descriptor saved by `enroll`
    Check {
        /// JSON descriptor file produced by `enroll`
        descriptor: PathBuf,
        candidate: PathBuf,
    },
    /// Load the models and report verifier state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let verifier = Verifier::from_config(&config);

    let output = match cli.command {
        Commands::Verify { reference, candidate } => {
            let reference = read(&reference)?;
            let candidate = read(&candidate)?;
            let result = verifier.verify(&reference, &candidate).await?;
            serde_json::to_value(result)?
        }
        Commands::Enroll { image } => {
            let image = read(&image)?;
            let descriptor = verifier.enroll(&image).await?;
            serde_json::to_value(descriptor)?
        }
        Commands::Check { descriptor, candidate } => {
            let enrolled: FaceDescriptor = serde_json::from_slice(&read(&descriptor)?)
                .with_context(|| format!("parsing descriptor {}", descriptor.display()))?;
            let candidate = read(&candidate)?;
            let result = verifier.verify_enrolled(&enrolled, &candidate).await?;
            serde_json::to_value(result)?
        }
        Commands::Status => {
            if let Err(err) = verifier.warm_up().await {
                tracing::warn!(error = %err, "models unavailable; verification will use the fallback verifier");
            }
            serde_json::to_value(verifier.status())?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}
