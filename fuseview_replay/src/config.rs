//! Session configuration: every tunable in one place.

use fuseview_core::{
    BirdseyeConfig, Compositor, CompositorLayout, ConvolutionDetector, EkfConfig, FusionSequencer,
    GeometricProjector, LaneEkf, ProjectorConfig, RecordLayout, SequencerConfig,
};
use serde::{Deserialize, Serialize};

/// All component configurations for a replay session.
///
/// The birdseye cell size is owned by [`BirdseyeConfig`]; [`ReplayConfig::synced`]
/// copies it into the projector and compositor so the overlay and the panels agree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub layout: RecordLayout,
    pub sequencer: SequencerConfig,
    pub ekf: EkfConfig,
    pub birdseye: BirdseyeConfig,
    pub projector: ProjectorConfig,
    pub compositor: CompositorLayout,
}

impl ReplayConfig {
    /// Overrides the record image geometry and recentres the camera on it.
    pub fn with_image_size(mut self, width: u32, height: u32) -> Self {
        self.layout = RecordLayout {
            image_width: width,
            image_height: height,
        };
        self.birdseye.camera.cx = width as f64 / 2.0;
        self.birdseye.camera.cy = height as f64 / 2.0;
        self
    }

    /// Propagates shared constants between components.
    pub fn synced(mut self) -> Self {
        let m = self.birdseye.metres_per_cell;
        self.projector.metres_per_cell = m;
        self.compositor.metres_per_cell = m;
        self
    }

    pub fn sequencer(&self) -> FusionSequencer<LaneEkf, ConvolutionDetector> {
        FusionSequencer::with_config(
            LaneEkf::new(self.ekf.clone()),
            ConvolutionDetector::new(self.birdseye.clone()),
            self.sequencer.clone(),
        )
    }

    pub fn compositor(&self) -> Compositor {
        Compositor::new(
            self.compositor.clone(),
            GeometricProjector::new(self.projector.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recorder() {
        let config = ReplayConfig::default();
        assert_eq!(config.layout.record_size(), 320 * 140 + 55);
        assert_eq!(config.compositor.panel_width, 320);
        assert_eq!(config.birdseye.grid_width, 80);
    }

    #[test]
    fn test_synced_cell_size() {
        let mut config = ReplayConfig::default();
        config.birdseye.metres_per_cell = 0.05;
        let config = config.synced();
        assert_eq!(config.projector.metres_per_cell, 0.05);
        assert_eq!(config.compositor.metres_per_cell, 0.05);
    }

    #[test]
    fn test_image_size_recentres_camera() {
        let config = ReplayConfig::default().with_image_size(160, 120);
        assert_eq!(config.layout.record_size(), 160 * 120 + 55);
        assert_eq!(config.birdseye.camera.cx, 80.0);
        assert_eq!(config.birdseye.camera.cy, 60.0);
    }
}
