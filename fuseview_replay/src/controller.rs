//! Playback controller: one operator command per presented frame.
//!
//! ```text
//!   present ─► compose ─► video + display ─► wait for key
//!      ▲                                          │
//!      └──── advance / rewind ◄───────────────────┘ (q: stop)
//! ```

use crate::exporter::{TraceExport, TraceFrame};
use anyhow::{Context, Result};
use fuseview_core::{Compositor, Presented, SessionCursor, Step};
use fuseview_env::{Command, CommandSource, DetectorPort, EstimatorPort, FrameSink};
use std::io::{Read, Seek};
use tracing::{error, info};

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    EndOfStream,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Frames composed and pushed to the sinks (rewound frames included)
    pub frames_presented: u64,
    pub rewinds: u64,

    /// Record index on screen when the session ended
    pub final_index: u64,

    pub end: SessionEnd,
}

/// Drives a [`SessionCursor`] from operator commands.
///
/// The controller borrows its sinks; flushing them is the owner's job, so
/// it happens on every exit path including errors.
pub struct PlaybackController<'s> {
    compositor: Compositor,
    video: &'s mut dyn FrameSink,
    display: &'s mut dyn FrameSink,
    commands: &'s mut dyn CommandSource,
    trace: Option<&'s mut TraceExport>,
}

impl<'s> PlaybackController<'s> {
    pub fn new(
        compositor: Compositor,
        video: &'s mut dyn FrameSink,
        display: &'s mut dyn FrameSink,
        commands: &'s mut dyn CommandSource,
    ) -> Self {
        Self {
            compositor,
            video,
            display,
            commands,
            trace: None,
        }
    }

    /// Records every presented frame into `trace`.
    pub fn with_trace(mut self, trace: &'s mut TraceExport) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Runs until the operator quits or the log ends.
    ///
    /// Decode, seek and sink failures abort with an error; numerical trouble
    /// in the estimator or the projector only degrades the affected frame.
    pub fn run<R, E, D>(&mut self, cursor: &mut SessionCursor<R, E, D>) -> Result<SessionSummary>
    where
        R: Read + Seek,
        E: EstimatorPort,
        D: DetectorPort,
    {
        let mut frames_presented = 0;
        let mut rewinds = 0;
        let mut step = Step::Advanced;

        let end = loop {
            self.present(cursor.current(), step)?;
            frames_presented += 1;

            let command = self.commands.next_command().context("reading operator command")?;
            let moved = match command {
                Command::Quit => break SessionEnd::Quit,
                Command::Advance => cursor.advance(),
                Command::Rewind => cursor.rewind(),
            };

            match moved {
                Ok(next) => {
                    if next == Step::Rewound {
                        rewinds += 1;
                    }
                    step = next;
                }
                Err(e) if e.is_end_of_stream() => break SessionEnd::EndOfStream,
                Err(e) => {
                    error!("Aborting replay at record {}: {}", cursor.current().index, e);
                    return Err(e).context("moving through the log");
                }
            }
        };

        let summary = SessionSummary {
            frames_presented,
            rewinds,
            final_index: cursor.current().index,
            end,
        };
        info!(
            "Session ended ({:?}): {} frames presented, {} rewinds, last record {}",
            summary.end, summary.frames_presented, summary.rewinds, summary.final_index
        );
        Ok(summary)
    }

    fn present(&mut self, presented: &Presented, step: Step) -> Result<()> {
        let record = &presented.record;
        let report = &presented.report;

        info!(
            "{} {:.6} {:?} x_predict {:?} x_update {:?} \
             | throttle {} steering {} gyro {:?} servo {} wheels {:?}",
            record.frame_id,
            record.timestamp(),
            step,
            report.predicted.state.as_slice(),
            report.posterior.state.as_slice(),
            record.throttle,
            record.steering,
            record.gyro,
            record.servo,
            record.wheel_ticks,
        );

        let composite = self.compositor.compose(record, report);
        if let Err(e) = &composite.fan {
            error!(frame = record.frame_id, "uncertainty fan not drawn: {}", e);
        }

        self.video.push(&composite.frame).context("writing video frame")?;
        self.display.push(&composite.frame).context("updating display")?;

        if let Some(trace) = self.trace.as_deref_mut() {
            trace.add_frame(TraceFrame::new(presented, step, &composite.fan));
        }
        Ok(())
    }
}
