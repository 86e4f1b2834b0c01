//! FuseView Replay - interactive telemetry replay harness
//!
//! Wires the fusion core to real collaborators:
//! - **Sinks**: Y4M video file, PPM snapshot display, optional OpenCV window and writer
//! - **Commands**: terminal keystrokes, `highgui` keys, or a fixed script for batch runs
//! - **Trace**: per-frame JSON export of the fusion results
//! - **Synth**: deterministic synthetic drive logs for demos and end-to-end tests
//!
//! # Usage
//!
//! ```ignore
//! use fuseview_replay::{run_play, PlayOptions};
//!
//! let options = PlayOptions { batch: true, ..PlayOptions::new("drive.log") };
//! let summary = run_play(&options)?;
//! println!("{} frames", summary.frames_presented);
//! ```

pub mod config;
pub mod controller;
pub mod exporter;
#[cfg(feature = "opencv")]
pub mod opencv_sink;
pub mod runner;
pub mod sinks;
pub mod synth;
pub mod terminal;

pub use config::ReplayConfig;
pub use controller::{PlaybackController, SessionEnd, SessionSummary};
pub use exporter::{TraceExport, TraceFrame};
pub use runner::{run_play, run_synth, PlayOptions};
pub use sinks::{LazySink, NullSink, PpmSnapshotDisplay, SinkGuard, Y4mVideoSink};
pub use synth::{LaneSimulator, SynthConfig, TruthState};
pub use terminal::TerminalCommands;
