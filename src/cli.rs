use crate::batch::{score_table, BatchTable};
use crate::camera::NokhwaCamera;
use crate::cascade::HaarCascade;
use crate::config::{load_config, save_config, Config};
use crate::error::{Error, Result, ValidationError};
use crate::features::FeatureVector;
use crate::pipeline::ScoringContext;
use crate::vision::{annotate, OnnxEyeClassifier, VisionLoop};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "eyestate",
    version,
    about = "Eye open/closed classification from EEG readings or a camera"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify one set of EEG readings
    Predict {
        /// Channel reading; unspecified channels are 0.0
        #[arg(short, long = "set", value_name = "NAME=VALUE", value_parser = parse_reading)]
        set: Vec<(String, f64)>,
    },
    /// Score every row of a CSV file
    Batch {
        /// CSV with all 14 channel columns
        input: PathBuf,
        /// Destination CSV (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rank channels by model importance
    Importance,
    /// Classify eyes from the camera
    Watch {
        /// Stop after this many frames
        #[arg(short, long)]
        frames: Option<usize>,
        /// Save annotated frames into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },
    /// Write the default configuration file
    Init,
}

fn parse_reading(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for {name}: {e}"))?;
    Ok((name.trim().to_string(), value))
}

pub fn run_cli() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

pub fn execute(cli: Cli) -> Result<()> {
    let cfg = load_config();
    match cli.command {
        Commands::Predict { set } => predict(&cfg, &set),
        Commands::Batch { input, output } => batch(&cfg, input, output),
        Commands::Importance => importance(&cfg),
        Commands::Watch { frames, save_dir } => watch(&cfg, frames, save_dir),
        Commands::Init => {
            let path = save_config(&Config::default())?;
            info!(path = %path.display(), "default configuration written");
            Ok(())
        }
    }
}

fn scoring_context(cfg: &Config) -> Result<ScoringContext> {
    ScoringContext::load(&cfg.scaler_path, &cfg.model_path, cfg.hub().as_ref())
}

/// Applies the configured input range, then builds the vector.
pub fn readings_to_vector(cfg: &Config, readings: &[(String, f64)]) -> Result<FeatureVector> {
    let range = cfg.input_range;
    let mut seen = HashSet::new();
    if let Some((name, _)) = readings.iter().find(|(name, _)| !seen.insert(name.as_str())) {
        return Err(ValidationError::DuplicateChannel(name.clone()).into());
    }
    if let Some((name, value)) = readings.iter().find(|(_, v)| !range.contains(*v)) {
        return Err(ValidationError::OutOfRange {
            channel: name.clone(),
            value: *value,
            min: range.min,
            max: range.max,
        }
        .into());
    }
    FeatureVector::from_named(readings.iter().map(|(n, v)| (n.as_str(), *v)))
}

fn predict(cfg: &Config, readings: &[(String, f64)]) -> Result<()> {
    let vector = readings_to_vector(cfg, readings)?;
    let ctx = scoring_context(cfg)?;
    let p = ctx.score(&vector);
    println!("Eyes: {}", p.state);
    println!("Confidence: {:.2}%", p.confidence());
    println!(
        "Closed: {:.2}% | Open: {:.2}%",
        p.probabilities.closed * 100.0,
        p.probabilities.open * 100.0
    );
    if p.is_low_confidence() {
        println!("Low confidence prediction (inputs near average EEG)");
    }
    Ok(())
}

fn batch(cfg: &Config, input: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let ctx = scoring_context(cfg)?;
    let table = BatchTable::read_csv(BufReader::new(File::open(&input)?))?;
    let scored = score_table(&ctx, table)?;
    match output {
        Some(path) => {
            scored.write_csv(BufWriter::new(File::create(&path)?))?;
            info!(rows = scored.len(), path = %path.display(), "predictions written");
        }
        None => scored.write_csv(io::stdout().lock())?,
    }
    Ok(())
}

fn importance(cfg: &Config) -> Result<()> {
    let ctx = scoring_context(cfg)?;
    println!("{:>4}  {:<8}{:>10}", "rank", "channel", "importance");
    for (rank, (name, score)) in ctx.feature_importance().iter().enumerate() {
        println!("{:>4}  {:<8}{:>10.4}", rank + 1, name, score);
    }
    Ok(())
}

fn watch(cfg: &Config, frames: Option<usize>, save_dir: Option<PathBuf>) -> Result<()> {
    let hub = cfg.hub();
    let cascade = HaarCascade::load(&cfg.vision.cascade_path, hub.as_ref())?;
    let classifier = OnnxEyeClassifier::load(&cfg.vision.model_path, cfg.vision.layout, hub.as_ref())?;
    if let Some(dir) = &save_dir {
        std::fs::create_dir_all(dir)?;
    }
    let camera = NokhwaCamera::open(cfg.vision.camera_index)?;

    let keep_running = Arc::new(AtomicBool::new(frames != Some(0)));
    let on_interrupt = Arc::clone(&keep_running);
    ctrlc::set_handler(move || {
        info!("interrupt received, stopping camera");
        on_interrupt.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Device(format!("failed to install interrupt handler: {e}")))?;
    let mut seen = 0usize;
    let mut vision = VisionLoop::new(cascade, classifier);
    vision.run(camera, &keep_running, |frame, observations| {
        for obs in observations {
            println!(
                "frame {seen}: ({}, {}, {}x{}) {} score={:.3}",
                obs.region.x, obs.region.y, obs.region.width, obs.region.height, obs.state, obs.score
            );
        }
        if let Some(dir) = &save_dir {
            let mut annotated = frame.clone();
            annotate(&mut annotated, observations);
            let path = dir.join(format!("frame_{seen:05}.png"));
            if let Err(e) = annotated.save(&path) {
                error!("failed to save {}: {e}", path.display());
            }
        }
        seen += 1;
        if frames.is_some_and(|limit| seen >= limit) {
            keep_running.store(false, Ordering::Relaxed);
        }
    })?;
    Ok(())
}
