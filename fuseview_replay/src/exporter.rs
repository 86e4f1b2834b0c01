//! JSON state trace for offline analysis.
//!
//! One entry per presented frame, in presentation order, so rewinds show up
//! as repeated frame ids.

use fuseview_core::{Presented, ProjectionError, Step, UpdateKind, UpdateStatus};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// Fusion result for one presented frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFrame {
    /// Zero-based record index in the log
    pub index: u64,
    pub frame_id: u32,

    /// Record timestamp in seconds
    pub timestamp: f64,

    /// Prediction step (seconds)
    pub dt: f64,

    /// State after the predict step
    pub predicted: Vec<f64>,

    /// State after all updates
    pub posterior: Vec<f64>,

    /// Posterior covariance diagonal
    pub variances: Vec<f64>,

    pub updates: Vec<(UpdateKind, UpdateStatus)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_error: Option<String>,

    /// True if the frame was reached by rewinding
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub rewound: bool,
}

impl TraceFrame {
    pub fn new(presented: &Presented, step: Step, fan: &Result<(), ProjectionError>) -> Self {
        let report = &presented.report;
        Self {
            index: presented.index,
            frame_id: presented.record.frame_id,
            timestamp: presented.record.timestamp(),
            dt: report.dt,
            predicted: report.predicted.state.iter().copied().collect(),
            posterior: report.posterior.state.iter().copied().collect(),
            variances: report.posterior.variances().iter().copied().collect(),
            updates: report.updates.clone(),
            fan_error: fan.as_ref().err().map(|e| e.to_string()),
            rewound: step == Step::Rewound,
        }
    }
}

/// Complete replay trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceExport {
    /// Log file the trace was produced from
    pub log: String,

    pub frames: Vec<TraceFrame>,

    pub rewinds: u64,
}

impl TraceExport {
    pub fn new(log: &str) -> Self {
        Self {
            log: log.to_string(),
            frames: Vec::new(),
            rewinds: 0,
        }
    }

    pub fn add_frame(&mut self, frame: TraceFrame) {
        if frame.rewound {
            self.rewinds += 1;
        }
        self.frames.push(frame);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuseview_core::testing::{test_log, FixedDetector, RecordingEstimator, TEST_LAYOUT};
    use fuseview_core::{FusionSequencer, SessionCursor, TelemetryReader};
    use std::io::Cursor;

    fn cursor() -> SessionCursor<Cursor<Vec<u8>>, RecordingEstimator, FixedDetector> {
        let reader = TelemetryReader::new(Cursor::new(test_log(3)), TEST_LAYOUT);
        let sequencer = FusionSequencer::new(RecordingEstimator::default(), FixedDetector::none());
        SessionCursor::open(reader, sequencer).unwrap()
    }

    #[test]
    fn test_trace_frame_from_presented() {
        let cursor = cursor();
        let frame = TraceFrame::new(cursor.current(), Step::Advanced, &Ok(()));

        assert_eq!(frame.index, 0);
        assert_eq!(frame.frame_id, 0);
        assert_eq!(frame.posterior.len(), 6);
        assert_eq!(frame.variances.len(), 6);
        assert_eq!(frame.updates[0], (UpdateKind::Centerline, UpdateStatus::Skipped));
        assert!(frame.fan_error.is_none());
        assert!(!frame.rewound);
    }

    #[test]
    fn test_rewinds_counted_and_serialized() {
        let mut cursor = cursor();
        let mut export = TraceExport::new("drive.log");
        export.add_frame(TraceFrame::new(cursor.current(), Step::Advanced, &Ok(())));
        cursor.advance().unwrap();
        let step = cursor.rewind().unwrap();
        let fan = Err(ProjectionError::NonFiniteCovariance);
        export.add_frame(TraceFrame::new(cursor.current(), step, &fan));

        assert_eq!(export.rewinds, 1);
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["frames"][1]["rewound"], true);
        assert!(json["frames"][0].get("rewound").is_none());
        assert_eq!(json["frames"][1]["updates"][1][0], "yaw_rate");
        assert!(json["frames"][1]["fan_error"].as_str().unwrap().contains("non-finite"));
    }
}
