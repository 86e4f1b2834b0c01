//! FuseView Core - Telemetry Replay & Fusion Debugger Engine
//!
//! Replays recorded vehicle telemetry through a sequential state estimator
//! and renders what the estimator believes:
//! 1. **Sequencing**: one predict plus centerline, yaw-rate and wheel-speed updates per
//!    record, in a fixed order
//! 2. **Rewind**: pre-cycle snapshots let the operator step back and re-run a frame exactly
//! 3. **Uncertainty**: state and covariance projected into a birdseye debug panel

pub mod compositor;
pub mod cursor;
pub mod detector;
pub mod estimator;
pub mod history;
pub mod projector;
pub mod sequencer;
pub mod telemetry;
pub mod testing;

// Re-export key types for convenience
pub use compositor::{rasterize, Composite, Compositor, CompositorLayout};
pub use cursor::{CursorError, Presented, SessionCursor, Step};
pub use detector::{BirdseyeConfig, CameraModel, ConvolutionDetector};
pub use estimator::{EkfConfig, LaneEkf};
pub use history::{HistoryEntry, HistoryError, HistoryStack};
pub use projector::{
    GeometricProjector, PanelGeometry, ProjectionError, ProjectorConfig, VisualState,
};
pub use sequencer::{
    CycleReport, FusionSequencer, FusionState, SequencerConfig, UpdateKind, UpdateStatus,
};
pub use telemetry::{
    RecordLayout, TelemetryError, TelemetryReader, TelemetryRecord, TelemetryWriter,
};
