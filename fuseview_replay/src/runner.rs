//! Session wiring: opens the log, picks sinks and command source, runs the
//! controller and releases everything on the way out.

use crate::config::ReplayConfig;
use crate::controller::{PlaybackController, SessionEnd, SessionSummary};
use crate::exporter::TraceExport;
use crate::sinks::{LazySink, NullSink, PpmSnapshotDisplay, SinkGuard};
use crate::synth::{self, SynthConfig};
use anyhow::{Context, Result};
use fuseview_core::{SessionCursor, TelemetryReader};
use fuseview_env::{CommandSource, FrameSink, ScriptedCommands};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Options for an interactive (or batch) replay.
#[derive(Debug, Clone)]
pub struct PlayOptions {
    pub log: PathBuf,

    /// Video output, created on the first frame
    pub video: PathBuf,

    /// PPM file rewritten with every composite
    pub snapshot: Option<PathBuf>,

    /// Advance through every record without waiting for keys
    pub batch: bool,

    /// JSON state trace written when the session ends
    pub export: Option<PathBuf>,

    pub config: ReplayConfig,
}

impl PlayOptions {
    pub fn new(log: impl Into<PathBuf>) -> Self {
        Self {
            log: log.into(),
            video: PathBuf::from("replay.y4m"),
            snapshot: None,
            batch: false,
            export: None,
            config: ReplayConfig::default(),
        }
    }
}

#[cfg(not(feature = "opencv"))]
fn video_sink(options: &PlayOptions) -> Result<Box<dyn FrameSink>> {
    use crate::sinks::Y4mVideoSink;
    let path = options.video.clone();
    Ok(Box::new(LazySink::new(move || Y4mVideoSink::create(&path))))
}

#[cfg(feature = "opencv")]
fn video_sink(options: &PlayOptions) -> Result<Box<dyn FrameSink>> {
    use crate::opencv_sink::OpenCvVideoWriter;
    let path = options.video.clone();
    Ok(Box::new(LazySink::new(move || Ok(OpenCvVideoWriter::new(path)))))
}

#[cfg(not(feature = "opencv"))]
fn display_sink(options: &PlayOptions) -> Result<Box<dyn FrameSink>> {
    Ok(match &options.snapshot {
        Some(path) => Box::new(PpmSnapshotDisplay::new(path.clone())),
        None => Box::new(NullSink),
    })
}

#[cfg(feature = "opencv")]
fn display_sink(options: &PlayOptions) -> Result<Box<dyn FrameSink>> {
    use crate::opencv_sink::HighGuiDisplay;
    if let Some(path) = &options.snapshot {
        return Ok(Box::new(PpmSnapshotDisplay::new(path.clone())));
    }
    if options.batch {
        return Ok(Box::new(NullSink));
    }
    Ok(Box::new(HighGuiDisplay::new(false)?))
}

#[cfg(not(feature = "opencv"))]
fn command_source(options: &PlayOptions) -> Box<dyn CommandSource> {
    use crate::terminal::TerminalCommands;
    if options.batch {
        Box::new(ScriptedCommands::advance_forever())
    } else {
        info!("Keys: ',' rewind, 'q' quit, anything else advances");
        Box::new(TerminalCommands::new())
    }
}

#[cfg(feature = "opencv")]
fn command_source(options: &PlayOptions) -> Box<dyn CommandSource> {
    use crate::opencv_sink::HighGuiKeys;
    use crate::terminal::TerminalCommands;
    if options.batch {
        Box::new(ScriptedCommands::advance_forever())
    } else if options.snapshot.is_some() {
        Box::new(TerminalCommands::new())
    } else {
        info!("Keys (in the window): ',' rewind, 'q' quit, anything else advances");
        Box::new(HighGuiKeys)
    }
}

/// Replays a log file end to end.
pub fn run_play(options: &PlayOptions) -> Result<SessionSummary> {
    let config = options.config.clone().synced();
    info!("Replaying {}", options.log.display());

    let reader = TelemetryReader::open(&options.log, config.layout)
        .with_context(|| format!("opening {}", options.log.display()))?;
    let mut cursor = match SessionCursor::open(reader, config.sequencer()) {
        Ok(cursor) => cursor,
        Err(e) if e.is_end_of_stream() => {
            warn!("{} holds no complete record", options.log.display());
            return Ok(SessionSummary {
                frames_presented: 0,
                rewinds: 0,
                final_index: 0,
                end: SessionEnd::EndOfStream,
            });
        }
        Err(e) => return Err(e).context("reading the first record"),
    };

    // Guards flush on every exit path, including `?` below
    let mut video = SinkGuard::new(video_sink(options)?);
    let mut display = SinkGuard::new(display_sink(options)?);
    let mut commands = command_source(options);
    let mut trace = options
        .export
        .as_ref()
        .map(|_| TraceExport::new(&options.log.to_string_lossy()));

    let outcome = {
        let mut controller =
            PlaybackController::new(config.compositor(), &mut video, &mut display, &mut commands);
        if let Some(trace) = trace.as_mut() {
            controller = controller.with_trace(trace);
        }
        controller.run(&mut cursor)
    };

    if let (Some(path), Some(trace)) = (&options.export, &trace) {
        match trace.write_to_file(&path.to_string_lossy()) {
            Ok(()) => info!("Exported {} frames to {}", trace.frames.len(), path.display()),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }

    let summary = outcome?;
    video.finish().context("flushing video")?;
    display.finish().context("closing display")?;
    Ok(summary)
}

/// Writes a synthetic log.
pub fn run_synth(out: &Path, frames: u32, seed: u64, config: &ReplayConfig) -> Result<()> {
    synth::generate(out, frames, seed, SynthConfig::default(), config)
        .with_context(|| format!("writing {}", out.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fuseview-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_synth_then_batch_replay() {
        let log = temp_path("drive.log");
        let video = temp_path("drive.y4m");
        let export = temp_path("drive.json");
        let config = ReplayConfig::default();
        run_synth(&log, 6, 42, &config).unwrap();

        let options = PlayOptions {
            video: video.clone(),
            batch: true,
            export: Some(export.clone()),
            ..PlayOptions::new(&log)
        };
        let summary = run_play(&options).unwrap();
        assert_eq!(summary.end, SessionEnd::EndOfStream);
        assert_eq!(summary.frames_presented, 6);

        let trace: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&export).unwrap()).unwrap();
        assert_eq!(trace["frames"].as_array().unwrap().len(), 6);
        assert!(fs::read(&video).unwrap().starts_with(b"YUV4MPEG2 W640 H"));

        for path in [log, video, export] {
            let _ = fs::remove_file(path);
        }
    }

    #[test]
    fn test_empty_log_creates_no_video() {
        let log = temp_path("empty.log");
        let video = temp_path("empty.y4m");
        fs::write(&log, b"").unwrap();

        let options = PlayOptions {
            video: video.clone(),
            batch: true,
            ..PlayOptions::new(&log)
        };
        let summary = run_play(&options).unwrap();
        assert_eq!(summary.frames_presented, 0);
        assert!(!video.exists());

        let _ = fs::remove_file(log);
    }

    #[test]
    fn test_missing_log_is_an_error() {
        let options = PlayOptions {
            batch: true,
            ..PlayOptions::new(temp_path("does-not-exist.log"))
        };
        assert!(run_play(&options).is_err());
    }
}
