//! Session cursor: stream position, fusion state and history as one unit.
//!
//! Rewinding is a coupled operation across three things (the history stack,
//! the running estimate and the byte position in the log). The cursor owns
//! all three and only exposes `advance()`, `rewind()` and `current()`.
//!
//! ```text
//!            advance                         rewind
//!  frame k ──────────► frame k+1     frame k+1 ──────► frame k
//!  push(pre_k)                       pop() -> pre_k
//!  commit(record_k)                  seek back 2 records
//!  read + cycle k+1                  read + cycle k (re-run, not cached)
//! ```

use crate::history::{HistoryEntry, HistoryError, HistoryStack};
use crate::sequencer::{CycleReport, FusionSequencer, FusionState};
use crate::telemetry::{TelemetryError, TelemetryReader, TelemetryRecord};
use fuseview_env::{DetectorPort, EstimatorPort};
use std::io::{Read, Seek};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

impl CursorError {
    /// True when the log simply ran out of records.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            CursorError::Telemetry(e) => e.is_end_of_stream(),
            CursorError::History(_) => false,
        }
    }
}

/// How the cursor arrived at the frame it now presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advanced,
    Rewound,
}

/// The frame currently on screen.
#[derive(Debug, Clone)]
pub struct Presented {
    /// Zero-based record index in the log
    pub index: u64,

    pub record: TelemetryRecord,
    pub report: CycleReport,

    /// Fusion state before this frame's cycle ran
    pub pre_cycle: HistoryEntry,
}

/// Drives fusion over a log with exact single-step rewind.
pub struct SessionCursor<R, E, D> {
    reader: TelemetryReader<R>,
    sequencer: FusionSequencer<E, D>,
    history: HistoryStack,
    fusion: FusionState,
    current: Presented,
}

impl<R, E, D> SessionCursor<R, E, D>
where
    R: Read + Seek,
    E: EstimatorPort,
    D: DetectorPort,
{
    /// Reads and fuses the first record.
    ///
    /// An empty log fails with `EndOfStream`.
    pub fn open(
        mut reader: TelemetryReader<R>,
        sequencer: FusionSequencer<E, D>,
    ) -> Result<Self, CursorError> {
        let mut fusion = sequencer.initial_state();
        let record = reader.read_record()?;
        let current = present(&sequencer, &mut fusion, record, reader.position() - 1);

        Ok(Self {
            reader,
            sequencer,
            history: HistoryStack::new(),
            fusion,
            current,
        })
    }

    pub fn current(&self) -> &Presented {
        &self.current
    }

    pub fn depth(&self) -> usize {
        self.history.depth()
    }

    pub fn sequencer(&self) -> &FusionSequencer<E, D> {
        &self.sequencer
    }

    /// Commits the current frame and fuses the next record.
    ///
    /// On `EndOfStream` nothing is committed and the current frame stays.
    pub fn advance(&mut self) -> Result<Step, CursorError> {
        let record = self.reader.read_record()?;

        self.history.push(self.current.pre_cycle.clone());
        self.fusion.commit(&self.current.record);

        let index = self.reader.position() - 1;
        self.current = present(&self.sequencer, &mut self.fusion, record, index);
        Ok(Step::Advanced)
    }

    /// Steps back one frame, re-running its cycle from the saved snapshot.
    ///
    /// With empty history this behaves exactly like [`advance`](Self::advance).
    pub fn rewind(&mut self) -> Result<Step, CursorError> {
        if self.history.is_empty() {
            debug!("rewind at history depth 0, advancing instead");
            return self.advance();
        }

        // Back past the frame on screen and the one before it, then re-read
        let resume_at = self.reader.position();
        self.reader.seek_back(2)?;
        let record = match self.reader.read_record() {
            Ok(record) => record,
            Err(e) => {
                // Leave the cursor where it was
                self.reader.seek_to(resume_at)?;
                return Err(e.into());
            }
        };

        self.fusion = FusionState::from(self.history.pop()?);

        let index = self.reader.position() - 1;
        self.current = present(&self.sequencer, &mut self.fusion, record, index);
        Ok(Step::Rewound)
    }
}

fn present<E: EstimatorPort, D: DetectorPort>(
    sequencer: &FusionSequencer<E, D>,
    fusion: &mut FusionState,
    record: TelemetryRecord,
    index: u64,
) -> Presented {
    let pre_cycle = HistoryEntry::from(&*fusion);
    let report = sequencer.cycle(fusion, &record);
    Presented {
        index,
        record,
        report,
        pre_cycle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordLayout;
    use crate::testing::{test_log, FixedDetector, RecordingEstimator, TEST_LAYOUT};
    use crate::LaneEkf;
    use std::io::Cursor;

    fn cursor_over(
        frames: u32,
    ) -> SessionCursor<Cursor<Vec<u8>>, LaneEkf, FixedDetector> {
        let reader = TelemetryReader::new(Cursor::new(test_log(frames)), TEST_LAYOUT);
        SessionCursor::open(reader, FusionSequencer::new(LaneEkf::default(), FixedDetector::lane()))
            .unwrap()
    }

    #[test]
    fn test_open_presents_first_record() {
        let cursor = cursor_over(3);
        assert_eq!(cursor.current().index, 0);
        assert_eq!(cursor.depth(), 0);
        assert_eq!(cursor.current().pre_cycle.prev_timestamp, None);
    }

    #[test]
    fn test_open_empty_log() {
        let reader = TelemetryReader::new(Cursor::new(Vec::new()), RecordLayout::default());
        let result = SessionCursor::open(
            reader,
            FusionSequencer::new(RecordingEstimator::default(), FixedDetector::none()),
        );
        assert!(result.err().unwrap().is_end_of_stream());
    }

    #[test]
    fn test_advance_pushes_history() {
        let mut cursor = cursor_over(3);
        let first = cursor.current().record.clone();
        assert_eq!(cursor.advance().unwrap(), Step::Advanced);

        assert_eq!(cursor.depth(), 1);
        assert_eq!(cursor.current().index, 1);
        assert_eq!(cursor.current().pre_cycle.prev_timestamp, Some(first.timestamp()));
        assert_eq!(cursor.current().pre_cycle.prev_wheel_ticks, Some(first.wheel_ticks));
    }

    #[test]
    fn test_advance_then_rewind_restores_snapshot() {
        let mut cursor = cursor_over(5);
        cursor.advance().unwrap();
        cursor.advance().unwrap();

        let before = cursor.current().clone();
        cursor.advance().unwrap();
        assert_eq!(cursor.rewind().unwrap(), Step::Rewound);

        let after = cursor.current();
        assert_eq!(after.index, before.index);
        assert_eq!(after.record, before.record);
        assert_eq!(after.pre_cycle, before.pre_cycle);
        assert_eq!(after.report.posterior, before.report.posterior);
        assert_eq!(cursor.depth(), 2);
    }

    #[test]
    fn test_repeated_rewind_walks_back() {
        let mut cursor = cursor_over(4);
        let start = cursor.current().clone();
        cursor.advance().unwrap();
        cursor.advance().unwrap();

        cursor.rewind().unwrap();
        cursor.rewind().unwrap();
        assert_eq!(cursor.current().index, 0);
        assert_eq!(cursor.current().pre_cycle, start.pre_cycle);
        assert_eq!(cursor.current().report.posterior, start.report.posterior);
        assert_eq!(cursor.depth(), 0);
    }

    #[test]
    fn test_rewind_at_depth_zero_behaves_as_advance() {
        let mut rewound = cursor_over(3);
        let mut advanced = cursor_over(3);

        assert_eq!(rewound.rewind().unwrap(), Step::Advanced);
        advanced.advance().unwrap();

        assert_eq!(rewound.current().index, advanced.current().index);
        assert_eq!(rewound.current().pre_cycle, advanced.current().pre_cycle);
        assert_eq!(rewound.current().report.posterior, advanced.current().report.posterior);
    }

    #[test]
    fn test_end_of_stream_keeps_current_frame() {
        let mut cursor = cursor_over(2);
        cursor.advance().unwrap();
        let err = cursor.advance().unwrap_err();

        assert!(err.is_end_of_stream());
        assert_eq!(cursor.current().index, 1);
        assert_eq!(cursor.depth(), 1);
    }

    #[test]
    fn test_truncated_tail_ends_cleanly() {
        let mut bytes = test_log(2);
        bytes.truncate(bytes.len() - 7);
        let reader = TelemetryReader::new(Cursor::new(bytes), TEST_LAYOUT);
        let mut cursor = SessionCursor::open(
            reader,
            FusionSequencer::new(RecordingEstimator::default(), FixedDetector::none()),
        )
        .unwrap();

        let err = cursor.advance().unwrap_err();
        assert!(matches!(
            err,
            CursorError::Telemetry(TelemetryError::EndOfStream { .. })
        ));
    }
}
