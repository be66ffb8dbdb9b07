use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use score_reloc::config::RelocConfig;
use score_reloc::dispatch::{Dispatch, Serial, ThreadPool};
use score_reloc::error::RelocError;
use score_reloc::forest::ScoreForest;
use score_reloc::io::{list_frames, load_frame, PoseWriter};
use score_reloc::relocaliser::ScoreRelocaliser;

/// Relocalise a directory of RGB-D frames against a frozen SCoRe forest.
#[derive(Debug, Parser)]
#[command(name = "reloc", version, about)]
struct Args {
    /// Frozen forest file (GFOR format).
    #[arg(long)]
    forest: PathBuf,

    /// Directory of .gfrm frame files.
    #[arg(long)]
    frames: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output CSV of per-frame poses.
    #[arg(long, default_value = "poses.csv")]
    out: PathBuf,

    /// Run every dispatch single-threaded (reproducible with a fixed seed).
    #[arg(long)]
    serial: bool,

    /// Override the configured RNG seed.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        // At least one frame failed to relocalise.
        Ok(false) => ExitCode::from(3),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<bool> {
    let mut config = match &args.config {
        Some(path) => RelocConfig::load_from_path(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => RelocConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.rng_seed = seed;
    }

    let forest = Arc::new(
        ScoreForest::load(&args.forest)
            .with_context(|| format!("cannot load forest {}", args.forest.display()))?,
    );
    let dispatch: Arc<dyn Dispatch> = if args.serial {
        Arc::new(Serial)
    } else {
        Arc::new(ThreadPool)
    };
    let mut relocaliser = ScoreRelocaliser::new(forest, config, dispatch);

    let frame_paths = list_frames(&args.frames)?;
    let mut writer = PoseWriter::create(&args.out)?;
    info!(frames = frame_paths.len(), out = %args.out.display(), "starting relocalisation");

    let mut failures = 0usize;
    for path in &frame_paths {
        let frame = load_frame(path)?;
        let started = Instant::now();
        match relocaliser.relocalise(&frame.keypoints, &frame.descriptors) {
            Ok(pose) => {
                info!(
                    frame = %frame.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    tx = pose.translation.x,
                    ty = pose.translation.y,
                    tz = pose.translation.z,
                    "relocalised"
                );
                writer.write(&frame.id, Some(&pose))?;
            }
            Err(error @ (RelocError::EmptyCandidatePool
            | RelocError::Timeout
            | RelocError::Cancelled)) => {
                warn!(frame = %frame.id, %error, "relocalisation failed");
                writer.write(&frame.id, None)?;
                failures += 1;
            }
            Err(error) => {
                // Shape mismatches mean the inputs are unusable, not that the
                // frame merely failed to localise.
                return Err(error).with_context(|| format!("frame {}", frame.id));
            }
        }
    }
    writer.flush()?;

    if failures > 0 {
        warn!(failures, total = frame_paths.len(), "finished with failures");
    } else {
        info!(total = frame_paths.len(), "finished");
    }
    Ok(failures == 0)
}
