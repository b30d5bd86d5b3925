//! `texgen`: generate a texture from a text prompt and store it on disk.
//!
//! ```bash
//! texgen generate --prompt "mossy cobblestone" --dest Textures/Stone
//! texgen generate -p "rusted metal" --name Rust --seed 42 --param style_preset=photographic
//! texgen models
//! ```

mod config;
mod error;
mod sink;

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use image::ImageFormat;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tg_core::{GenerationModel, GenerationSpec, GeneratorConfig, HttpTransport, JobState, Orchestrator};

use crate::config::Overrides;
use crate::error::AppError;
use crate::sink::{ConflictPolicy, FsAssetSink};

const DEFAULT_STRENGTH: f32 = 0.5;

#[derive(Parser, Debug)]
#[command(name = "texgen")]
#[command(version)]
#[command(about = "Generate textures from text prompts", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one texture and wait for it
    Generate(GenerateArgs),
    /// List the generation models
    Models,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Text prompt
    #[arg(short, long)]
    prompt: String,

    /// Asset destination, e.g. Textures/Rock. Defaults to the configured asset path
    #[arg(short, long)]
    dest: Option<String>,

    /// Asset name; taken from the last destination segment when omitted
    #[arg(short, long, required_unless_present = "dest")]
    name: Option<String>,

    /// What the image should not contain
    #[arg(long)]
    negative: Option<String>,

    #[arg(long)]
    seed: Option<u32>,

    /// ultra, core or sd3
    #[arg(short, long, default_value = "core")]
    model: GenerationModel,

    #[arg(long, requires = "height")]
    width: Option<u32>,

    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Reference image for image-to-image generation
    #[arg(long)]
    reference: Option<PathBuf>,

    /// How far the result may stray from the reference (0.0 - 1.0)
    #[arg(long)]
    strength: Option<f32>,

    /// Extra endpoint parameter as key=value, repeatable
    #[arg(long = "param")]
    params: Vec<String>,

    /// Slot key; jobs sharing a slot never run at the same time
    #[arg(long)]
    slot: Option<String>,

    /// Directory assets are written to
    #[arg(short, long, default_value = "assets")]
    out: PathBuf,

    /// Replace an existing asset generated from a different prompt
    #[arg(long, conflicts_with = "unique")]
    overwrite: bool,

    /// Write beside an existing asset under a suffixed name instead
    #[arg(long)]
    unique: bool,

    /// Override TEXGEN_ENDPOINT
    #[arg(long)]
    endpoint: Option<String>,

    /// Ask the endpoint for a JSON envelope instead of raw image bytes
    #[arg(long)]
    json: bool,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,
}

impl GenerateArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            endpoint: self.endpoint.clone(),
            json: self.json,
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
        }
    }

    fn conflict_policy(&self) -> ConflictPolicy {
        match (self.overwrite, self.unique) {
            (true, _) => ConflictPolicy::Overwrite,
            (_, true) => ConflictPolicy::Rename,
            _ => ConflictPolicy::Reject,
        }
    }

    fn spec(&self, config: &GeneratorConfig) -> anyhow::Result<GenerationSpec> {
        let destination = config::destination(config, self.dest.as_deref());
        let mut spec = GenerationSpec::new(&self.prompt, destination).with_model(self.model);

        if let Some(name) = &self.name {
            spec = spec.with_asset_name(name);
        }
        if let Some(negative) = &self.negative {
            spec = spec.with_negative_prompt(negative);
        }
        if let Some(seed) = self.seed {
            spec = spec.with_seed(seed);
        }
        if let (Some(width), Some(height)) = (self.width, self.height) {
            spec = spec.with_dimensions(width, height);
        }
        if let Some(slot) = &self.slot {
            spec = spec.with_slot(slot);
        }
        for param in &self.params {
            let (key, value) = parse_param(param)?;
            spec = spec.with_param(key, value);
        }

        match (&self.reference, self.strength) {
            (Some(path), strength) => {
                let image = image::open(path)
                    .with_context(|| format!("Failed to read reference image {}", path.display()))?;
                let mut png = Cursor::new(Vec::new());
                image.write_to(&mut png, ImageFormat::Png)?;
                spec = spec.with_reference(png.into_inner(), strength.unwrap_or(DEFAULT_STRENGTH));
            }
            (None, Some(_)) => return Err(AppError::StrengthWithoutReference.into()),
            (None, None) => {}
        }

        Ok(spec)
    }
}

fn parse_param(raw: &str) -> Result<(&str, &str), AppError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => Err(AppError::InvalidParam(raw.to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Command::Generate(args) => generate(args).await,
        Command::Models => {
            for model in GenerationModel::all() {
                println!("{:<6} {}", model.id(), model.name());
            }
            Ok(())
        }
    }
}

async fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let config = config::load(&args.overrides())?;
    let spec = args.spec(&config)?;

    let transport = HttpTransport::from_config(&config).context("Failed to create HTTP client")?;
    let sink = FsAssetSink::new(&args.out).with_conflict_policy(args.conflict_policy());
    let root = sink.root().to_path_buf();
    let orchestrator = Orchestrator::new(config, Arc::new(transport), Arc::new(sink));

    let mut events = orchestrator.subscribe();
    let id = orchestrator.submit(spec)?;
    info!("Submitted job {} ({}) to {}", id, args.model, orchestrator.config().endpoint);

    let wait = orchestrator.wait(id);
    tokio::pin!(wait);

    let snapshot = loop {
        tokio::select! {
            snapshot = &mut wait => break snapshot?,
            event = events.recv() => match event {
                Ok(event) if event.id == id => info!("{} {}", event.state.icon(), event.state),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("Missed {} job events", missed),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling job {}", id);
                orchestrator.cancel(id)?;
            }
        }
    };

    match (snapshot.state, snapshot.asset) {
        (JobState::Completed, Some(asset)) => {
            info!("Wrote {}", root.join(format!("{}.png", asset.path)).display());
            println!("{}", serde_json::to_string_pretty(&asset)?);
            Ok(())
        }
        (state, _) => Err(AppError::JobNotCompleted {
            id,
            state,
            reason: snapshot
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error recorded".to_string()),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> GenerateArgs {
        let mut argv = vec!["texgen", "generate", "--prompt", "red brick"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Generate(args) => args,
            Command::Models => unreachable!(),
        }
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("style_preset=pixel-art").unwrap(), ("style_preset", "pixel-art"));
        assert_eq!(parse_param("cfg=a=b").unwrap(), ("cfg", "a=b"));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_spec_from_flags() {
        let args = args(&[
            "--dest", "Textures/Brick", "--seed", "7", "--model", "ultra", "--width", "512", "--height", "256",
            "--param", "style_preset=photographic",
        ]);
        let spec = args.spec(&GeneratorConfig::default()).unwrap();

        assert_eq!(spec.destination, "Textures/Brick");
        assert_eq!(spec.seed, Some(7));
        assert_eq!(spec.model, GenerationModel::StableImageUltra);
        assert_eq!(spec.params["style_preset"], "photographic");
        assert_eq!(spec.target(), ("Textures".to_string(), "Brick".to_string()));
    }

    #[test]
    fn test_default_destination_needs_name() {
        assert!(Cli::try_parse_from(["texgen", "generate", "--prompt", "red brick"]).is_err());

        let spec = args(&["--name", "Brick"]).spec(&GeneratorConfig::default()).unwrap();
        assert_eq!(spec.target(), ("Generated".to_string(), "Brick".to_string()));
    }

    #[test]
    fn test_conflict_flags() {
        assert_eq!(args(&["--dest", "T/A"]).conflict_policy(), ConflictPolicy::Reject);
        assert_eq!(args(&["--dest", "T/A", "--overwrite"]).conflict_policy(), ConflictPolicy::Overwrite);
        assert_eq!(args(&["--dest", "T/A", "--unique"]).conflict_policy(), ConflictPolicy::Rename);
        assert!(
            Cli::try_parse_from(["texgen", "generate", "-p", "x", "--dest", "T/A", "--overwrite", "--unique"]).is_err()
        );
    }

    #[test]
    fn test_strength_requires_reference() {
        let err = args(&["--dest", "Textures/Brick", "--strength", "0.3"])
            .spec(&GeneratorConfig::default())
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::StrengthWithoutReference)));
    }
}
