//! FuseView replay CLI
//!
//! Step through a recorded drive with the fusion debug view, or generate a
//! synthetic drive to replay.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fuseview_replay::{run_play, run_synth, PlayOptions, ReplayConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// FuseView telemetry replay and fusion debugger
#[derive(Parser, Debug)]
#[command(name = "fuseview-replay")]
#[command(about = "Replay vehicle telemetry through the lane EKF", long_about = None)]
struct Args {
    /// Verbose output (per-update state vectors)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Replay a log: ',' rewinds, 'q' quits, any other key advances
    Play {
        /// Telemetry log to replay
        log: PathBuf,

        /// Video output
        #[arg(long, default_value = "replay.y4m")]
        video: PathBuf,

        /// PPM file rewritten with every frame, for an auto-reloading viewer
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Advance through every record without waiting for keys
        #[arg(long)]
        batch: bool,

        /// Write a JSON state trace on exit
        #[arg(long)]
        export: Option<PathBuf>,

        /// Camera image width in the log (pixels)
        #[arg(long, default_value = "320")]
        width: u32,

        /// Camera image height in the log (pixels)
        #[arg(long, default_value = "140")]
        height: u32,
    },

    /// Write a deterministic synthetic log
    Synth {
        /// Output log
        out: PathBuf,

        /// Number of records
        #[arg(short, long, default_value = "300")]
        frames: u32,

        /// Seed for every noise source
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Mode::Play {
            log,
            video,
            snapshot,
            batch,
            export,
            width,
            height,
        } => {
            let options = PlayOptions {
                video,
                snapshot,
                batch,
                export,
                config: ReplayConfig::default().with_image_size(width, height),
                ..PlayOptions::new(log)
            };
            let summary = run_play(&options)?;
            info!(
                "✓ {} frames presented ({} rewinds)",
                summary.frames_presented, summary.rewinds
            );
        }
        Mode::Synth { out, frames, seed } => {
            run_synth(&out, frames, seed, &ReplayConfig::default())?;
        }
    }
    Ok(())
}
