//! Debug frame composition.
//!
//! ```text
//! +---------------------+---------------------+
//! | camera (inverted)   | birdseye mask       |
//! |                     | (inverted, clipped) |
//! +---------------------+---------------------+
//! | conv response       | ReLU birdseye +     |
//! | 128 - r/4           | state overlay       |
//! +---------------------+---------------------+
//! ```
//!
//! Birdseye panels are stored nearest-row-first and drawn flipped so the
//! vehicle sits at the bottom.

use crate::projector::{GeometricProjector, PanelGeometry, ProjectionError};
use crate::sequencer::CycleReport;
use crate::telemetry::TelemetryRecord;
use fuseview_env::{
    peak_response, GrayImage, Label, Overlay, PixelRect, Primitive, RenderFrame, ResponseImage, Rgb,
};
use image::imageops::{self, FilterType};
use image::Luma;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Configuration for the Compositor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositorLayout {
    /// Width of each column of panels (pixels)
    pub panel_width: u32,

    /// Origin of the actuator bars; bars extend by the raw command value
    pub bar_origin_x: f64,
    pub throttle_bar_y: f64,
    pub steering_bar_y: f64,
    pub bar_weight: u32,

    pub throttle_color: Rgb,
    pub steering_color: Rgb,
    pub label_color: Rgb,

    /// Birdseye cell size shown in the caption (m)
    pub metres_per_cell: f64,
}

impl Default for CompositorLayout {
    fn default() -> Self {
        Self {
            panel_width: 320,
            bar_origin_x: 160.0,
            throttle_bar_y: 130.0,
            steering_bar_y: 135.0,
            bar_weight: 3,
            throttle_color: Rgb(0, 255, 0),
            steering_color: Rgb(180, 180, 255),
            label_color: Rgb(255, 255, 200),
            metres_per_cell: 0.025,
        }
    }
}

/// One composed frame plus the fan outcome for diagnostics.
#[derive(Debug, Clone)]
pub struct Composite {
    pub frame: RenderFrame,
    pub fan: Result<(), ProjectionError>,
}

/// Builds the four-panel debug frame for one cycle.
#[derive(Debug, Clone, Default)]
pub struct Compositor {
    layout: CompositorLayout,
    projector: GeometricProjector,
}

impl Compositor {
    pub fn new(layout: CompositorLayout, projector: GeometricProjector) -> Self {
        Self { layout, projector }
    }

    pub fn layout(&self) -> &CompositorLayout {
        &self.layout
    }

    pub fn projector(&self) -> &GeometricProjector {
        &self.projector
    }

    /// Geometry of the bottom-right panel for a birdseye grid of `grid_w x grid_h` cells.
    pub fn panel_geometry(&self, grid_w: u32, grid_h: u32) -> PanelGeometry {
        let width = self.layout.panel_width as f64;
        let cell_px = width / grid_w.max(1) as f64;
        PanelGeometry {
            width,
            height: (grid_h as f64 * cell_px).floor(),
            cell_px,
        }
    }

    pub fn compose(&self, record: &TelemetryRecord, report: &CycleReport) -> Composite {
        let pw = self.layout.panel_width;
        let detection = &report.detection;
        let (grid_w, grid_h) = detection.birdseye.dimensions();
        let panel = self.panel_geometry(grid_w, grid_h);
        let panel_h = panel.height as u32;
        let raw_h = record.image.height();

        let mut frame = RenderFrame::new(2 * pw, raw_h + panel_h);
        let annotated_area = PixelRect::new(pw, raw_h, pw, panel_h);

        // Top left: camera
        let mut camera = record.image.clone();
        imageops::invert(&mut camera);
        paste(&mut frame, &camera, PixelRect::new(0, 0, pw, raw_h));

        // Top right: mask, clipped to the camera row
        let mut mask = birdseye_panel(&detection.mask, pw, panel_h);
        imageops::invert(&mut mask);
        paste(&mut frame, &mask, PixelRect::new(pw, 0, pw, raw_h));

        // Bottom left: signed response around mid gray
        let response = to_gray(&detection.response, |r| 128.0 - 0.25 * r);
        let response = birdseye_panel(&response, pw, panel_h);
        paste(&mut frame, &response, PixelRect::new(0, raw_h, pw, panel_h));

        // Bottom right: normalized ReLU response
        let max = peak_response(&detection.birdseye);
        let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
        let birdseye = to_gray(&detection.birdseye, |r| r * scale);
        let birdseye = birdseye_panel(&birdseye, pw, panel_h);
        paste(&mut frame, &birdseye, annotated_area);

        let annotated = self
            .projector
            .annotate(&report.posterior, detection.centerline.as_ref(), &panel);
        frame.overlays.extend(annotated.primitives.iter().map(|p| {
            Overlay::clipped(p.translated(pw as f64, raw_h as f64), annotated_area)
        }));

        self.add_actuator_bars(&mut frame, record);
        self.add_labels(&mut frame, raw_h as f64);

        Composite {
            frame,
            fan: annotated.fan,
        }
    }

    fn add_actuator_bars(&self, frame: &mut RenderFrame, record: &TelemetryRecord) {
        let l = &self.layout;
        let bar = |y: f64, length: i8, color: Rgb| Primitive::Polyline {
            points: vec![
                Point2::new(l.bar_origin_x, y),
                Point2::new(l.bar_origin_x + length as f64, y),
            ],
            color,
            weight: l.bar_weight,
        };
        frame.overlays.push(Overlay::unclipped(bar(
            l.throttle_bar_y,
            record.throttle,
            l.throttle_color,
        )));
        frame.overlays.push(Overlay::unclipped(bar(
            l.steering_bar_y,
            record.steering,
            l.steering_color,
        )));
    }

    fn add_labels(&self, frame: &mut RenderFrame, bottom: f64) {
        let pw = self.layout.panel_width as f64;
        let mm = self.layout.metres_per_cell * 1000.0;
        let captions = [
            ("camera, inverted".to_string(), 10.0, 12.0),
            (format!("birdseye, {mm:.0}mm/cell"), pw + 10.0, 12.0),
            ("horizontal convolution w/ kernel".to_string(), 10.0, bottom + 12.0),
            ("[-1, -1, 2, 2, -1, -1]".to_string(), 10.0, bottom + 24.0),
            ("ReLU after conv, quadratic fit".to_string(), pw + 10.0, bottom + 12.0),
        ];
        frame.labels.extend(captions.into_iter().map(|(text, x, y)| Label {
            text,
            origin: Point2::new(x, y),
            color: self.layout.label_color,
        }));
    }
}

/// Quantizes a response image to gray levels through `f`, saturating at 0 and 255.
fn to_gray(response: &ResponseImage, f: impl Fn(f32) -> f32) -> GrayImage {
    GrayImage::from_fn(response.width(), response.height(), |x, y| {
        Luma([f(response.get_pixel(x, y)[0]).clamp(0.0, 255.0) as u8])
    })
}

/// Flips a nearest-row-first grid so row 0 is at the bottom, then scales it to the panel.
fn birdseye_panel(grid: &GrayImage, width: u32, height: u32) -> GrayImage {
    imageops::resize(&imageops::flip_vertical(grid), width, height, FilterType::Nearest)
}

/// Copies `src` into `area` of the frame, cropping whatever does not fit.
fn paste(frame: &mut RenderFrame, src: &GrayImage, area: PixelRect) {
    for (x, y, p) in src.enumerate_pixels() {
        if x < area.width && y < area.height {
            frame.put((area.x + x) as i64, (area.y + y) as i64, Rgb::gray(p[0]));
        }
    }
}

/// Draws `frame.overlays` into its pixels, each confined to its clip rectangle.
///
/// Used by sinks that cannot draw vector geometry themselves. Labels need a
/// font and are left to text-capable sinks.
pub fn rasterize(frame: &mut RenderFrame) {
    let overlays = std::mem::take(&mut frame.overlays);
    let bounds = frame.bounds();
    for overlay in &overlays {
        let clip = match &overlay.clip {
            Some(clip) => clip.intersect(&bounds),
            None => Some(bounds),
        };
        let Some(clip) = clip else {
            continue;
        };
        let mut canvas = Canvas {
            frame: &mut *frame,
            clip,
        };
        match &overlay.primitive {
            Primitive::Polyline { points, color, weight } => {
                for pair in points.windows(2) {
                    canvas.line(pair[0], pair[1], *color, *weight);
                }
            }
            Primitive::Circle { center, radius, color, weight } => {
                canvas.circle(*center, *radius, *color, *weight);
            }
        }
    }
    frame.overlays = overlays;
}

/// A frame restricted to one clip rectangle.
struct Canvas<'f> {
    frame: &'f mut RenderFrame,
    clip: PixelRect,
}

impl Canvas<'_> {
    fn plot(&mut self, x: i64, y: i64, color: Rgb) {
        if self.clip.contains(x, y) {
            self.frame.put(x, y, color);
        }
    }

    fn stamp(&mut self, x: i64, y: i64, color: Rgb, weight: u32) {
        let r = (weight.max(1) as i64 - 1) / 2;
        let extra = (weight.max(1) as i64 - 1) % 2;
        for dy in -r..=r + extra {
            for dx in -r..=r + extra {
                self.plot(x + dx, y + dy, color);
            }
        }
    }

    fn line(&mut self, a: Point2<f64>, b: Point2<f64>, color: Rgb, weight: u32) {
        if !(a.x.is_finite() && a.y.is_finite() && b.x.is_finite() && b.y.is_finite()) {
            return;
        }
        let margin = weight as f64;
        let lo = Point2::new(self.clip.x as f64 - margin, self.clip.y as f64 - margin);
        let hi = Point2::new(
            (self.clip.x + self.clip.width) as f64 + margin,
            (self.clip.y + self.clip.height) as f64 + margin,
        );
        let Some((a, b)) = clip_segment(a, b, lo, hi) else {
            return;
        };

        // Bresenham
        let (mut x, mut y) = (a.x.round() as i64, a.y.round() as i64);
        let (x1, y1) = (b.x.round() as i64, b.y.round() as i64);
        let dx = (x1 - x).abs();
        let dy = -(y1 - y).abs();
        let sx = if x < x1 { 1 } else { -1 };
        let sy = if y < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.stamp(x, y, color, weight);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn circle(&mut self, center: Point2<f64>, radius: f64, color: Rgb, weight: u32) {
        if !(center.x.is_finite() && center.y.is_finite() && radius.is_finite()) {
            return;
        }
        let half = weight.max(1) as f64 / 2.0;
        let outer = radius + half;
        let clip = self.clip;
        let x_lo = (center.x - outer).floor().max(clip.x as f64) as i64;
        let y_lo = (center.y - outer).floor().max(clip.y as f64) as i64;
        let x_hi = (center.x + outer).ceil().min((clip.x + clip.width) as f64 - 1.0) as i64;
        let y_hi = (center.y + outer).ceil().min((clip.y + clip.height) as f64 - 1.0) as i64;

        for y in y_lo..=y_hi {
            for x in x_lo..=x_hi {
                let dist = ((x as f64 - center.x).powi(2) + (y as f64 - center.y).powi(2)).sqrt();
                if (dist - radius).abs() <= half {
                    self.plot(x, y, color);
                }
            }
        }
    }
}

/// Liang-Barsky clip of segment `a -> b` to `[lo, hi]` on both axes.
fn clip_segment(
    a: Point2<f64>,
    b: Point2<f64>,
    lo: Point2<f64>,
    hi: Point2<f64>,
) -> Option<(Point2<f64>, Point2<f64>)> {
    let d = b - a;
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    let checks = [
        (-d.x, a.x - lo.x),
        (d.x, hi.x - a.x),
        (-d.y, a.y - lo.y),
        (d.y, hi.y - a.y),
    ];
    for (p, q) in checks {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            t0 = t0.max(t);
        } else {
            t1 = t1.min(t);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some((a + d * t0, a + d * t1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::FusionSequencer;
    use crate::testing::{test_record, FixedDetector, RecordingEstimator};
    use fuseview_env::{Detection, Estimate};
    use nalgebra::{DMatrix, DVector};

    fn full_size_record() -> TelemetryRecord {
        let mut record = test_record(0, 1.0, [0; 4]);
        record.image = GrayImage::from_fn(320, 140, |x, y| Luma([((y * 320 + x) % 251) as u8]));
        record.throttle = 40;
        record.steering = -20;
        record
    }

    fn report_with(detection: Detection, posterior: Estimate) -> CycleReport {
        CycleReport {
            dt: 1.0 / 30.0,
            detection,
            predicted: posterior.clone(),
            posterior,
            predict_applied: true,
            updates: Vec::new(),
        }
    }

    fn zero_estimate() -> Estimate {
        Estimate::from_variances(&DVector::from_element(6, 0.01))
    }

    fn blank_report() -> CycleReport {
        report_with(Detection::empty(80, 60), zero_estimate())
    }

    #[test]
    fn test_frame_layout() {
        let compositor = Compositor::default();
        let record = full_size_record();
        let composite = compositor.compose(&record, &blank_report());
        let frame = &composite.frame;

        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 140 + 240);
        // Camera is inverted
        assert_eq!(frame.get(5, 3), Rgb::gray(255 - record.image.get_pixel(5, 3)[0]));
        // Blank mask inverted is white, zero response is mid gray, empty birdseye is black
        assert_eq!(frame.get(400, 10), Rgb::gray(255));
        assert_eq!(frame.get(10, 200), Rgb::gray(128));
        assert_eq!(frame.get(400, 200), Rgb::gray(0));
        assert!(composite.fan.is_ok());
        assert_eq!(frame.labels.len(), 5);
    }

    #[test]
    fn test_birdseye_is_flipped_and_normalized() {
        let compositor = Compositor::default();
        let mut detection = Detection::empty(80, 60);
        // Nearest row, left column
        detection.birdseye.put_pixel(0, 0, Luma([8.0]));
        detection.birdseye.put_pixel(79, 59, Luma([4.0]));

        let report = report_with(detection, zero_estimate());
        let composite = compositor.compose(&full_size_record(), &report);
        let frame = &composite.frame;
        // Row 0 lands at the bottom of the panel
        assert_eq!(frame.get(320, 379), Rgb::gray(255));
        assert_eq!(frame.get(639, 140), Rgb::gray(127));
    }

    #[test]
    fn test_response_saturates_at_gray_limits() {
        let compositor = Compositor::default();
        let mut detection = Detection::empty(80, 60);
        detection.response.put_pixel(0, 59, Luma([-1000.0]));
        detection.response.put_pixel(79, 59, Luma([1000.0]));

        let report = report_with(detection, zero_estimate());
        let composite = compositor.compose(&full_size_record(), &report);
        // Far row is drawn at the top of the bottom-left panel
        assert_eq!(composite.frame.get(0, 140), Rgb::gray(255));
        assert_eq!(composite.frame.get(319, 140), Rgb::gray(0));
    }

    #[test]
    fn test_actuator_bars() {
        let compositor = Compositor::default();
        let composite = compositor.compose(&full_size_record(), &blank_report());
        let bars: Vec<_> = composite
            .frame
            .overlays
            .iter()
            .filter(|o| o.clip.is_none())
            .filter_map(|o| match &o.primitive {
                Primitive::Polyline { points, weight: 3, .. } => Some(points.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0][1], Point2::new(200.0, 130.0));
        assert_eq!(bars[1][1], Point2::new(140.0, 135.0));
    }

    #[test]
    fn test_overlay_is_placed_in_annotated_panel() {
        let compositor = Compositor::default();
        let composite = compositor.compose(&full_size_record(), &blank_report());
        // Mean trajectory of the zero state starts at the panel's bottom centre
        let mean = composite
            .frame
            .overlays
            .iter()
            .find(|o| o.primitive.weight() == 2)
            .unwrap();
        assert_eq!(mean.clip, Some(PixelRect::new(320, 140, 320, 240)));
        match &mean.primitive {
            Primitive::Polyline { points, .. } => assert_eq!(points[0], Point2::new(480.0, 380.0)),
            other => panic!("expected polyline, got {:?}", other),
        }
    }

    #[test]
    fn test_tight_curve_stays_inside_annotated_panel() {
        let compositor = Compositor::default();
        let mut estimate = zero_estimate();
        estimate.state[4] = -0.5;
        let report = report_with(Detection::empty(80, 60), estimate);
        let composite = compositor.compose(&full_size_record(), &report);

        let plain = composite.frame.clone();
        let mut drawn = composite.frame.clone();
        drawn.overlays.retain(|o| o.clip.is_some());
        rasterize(&mut drawn);

        let panel = PixelRect::new(320, 140, 320, 240);
        let mut outside = 0;
        let mut inside = 0;
        for (x, y, p) in drawn.image().enumerate_pixels() {
            if p != plain.image().get_pixel(x, y) {
                if panel.contains(x as i64, y as i64) {
                    inside += 1;
                } else {
                    outside += 1;
                }
            }
        }
        assert_eq!(outside, 0);
        assert!(inside > 0);
    }

    #[test]
    fn test_non_psd_covariance_still_composes() {
        let compositor = Compositor::default();
        let mut cov = DMatrix::identity(6, 6);
        cov[(3, 3)] = -2.0;
        let bad = Estimate::try_new(DVector::zeros(6), cov).unwrap();

        let report = report_with(Detection::empty(80, 60), bad);
        let composite = compositor.compose(&full_size_record(), &report);
        assert!(matches!(composite.fan, Err(ProjectionError::NonPositiveSemiDefinite { .. })));
        assert_eq!(composite.frame.height(), 380);
        assert!(composite.frame.overlays.iter().any(|o| o.primitive.weight() == 2));
    }

    #[test]
    fn test_compose_from_sequencer_output() {
        let seq = FusionSequencer::new(RecordingEstimator::default(), FixedDetector::lane());
        let mut fusion = seq.initial_state();
        let record = test_record(0, 1.0, [0; 4]);
        let report = seq.cycle(&mut fusion, &record);

        let composite = Compositor::default().compose(&record, &report);
        // 8x4 test grid: 40 px cells, 160 px tall panel
        assert_eq!(composite.frame.height(), 4 + 160);
        assert!(composite.fan.is_ok());
    }

    #[test]
    fn test_rasterize_line_and_circle() {
        let mut frame = RenderFrame::new(20, 20);
        frame.overlays.push(Overlay::unclipped(Primitive::Polyline {
            points: vec![Point2::new(2.0, 5.0), Point2::new(12.0, 5.0)],
            color: Rgb(255, 0, 0),
            weight: 1,
        }));
        frame.overlays.push(Overlay::unclipped(Primitive::Circle {
            center: Point2::new(10.0, 14.0),
            radius: 4.0,
            color: Rgb(0, 0, 255),
            weight: 1,
        }));
        rasterize(&mut frame);

        for x in 2..=12 {
            assert_eq!(frame.get(x, 5), Rgb(255, 0, 0));
        }
        assert_eq!(frame.get(14, 14), Rgb(0, 0, 255));
        assert_eq!(frame.get(10, 10), Rgb(0, 0, 255));
        assert_eq!(frame.get(10, 14), Rgb::BLACK);
        assert_eq!(frame.overlays.len(), 2);
    }

    #[test]
    fn test_rasterize_clips_far_geometry() {
        let mut frame = RenderFrame::new(10, 10);
        frame.overlays.push(Overlay::unclipped(Primitive::Polyline {
            points: vec![Point2::new(-1e9, 5.0), Point2::new(1e9, 5.0)],
            color: Rgb(1, 1, 1),
            weight: 3,
        }));
        // Encloses the whole frame without touching it
        frame.overlays.push(Overlay::unclipped(Primitive::Circle {
            center: Point2::new(5.0, 5.0),
            radius: 1e9,
            color: Rgb(2, 2, 2),
            weight: 1,
        }));
        rasterize(&mut frame);
        assert_eq!(frame.get(0, 5), Rgb(1, 1, 1));
        assert_eq!(frame.get(9, 4), Rgb(1, 1, 1));
    }

    #[test]
    fn test_rasterize_respects_clip_rectangle() {
        let mut frame = RenderFrame::new(20, 10);
        let clip = PixelRect::new(10, 0, 10, 10);
        frame.overlays.push(Overlay::clipped(
            Primitive::Polyline {
                points: vec![Point2::new(0.0, 5.0), Point2::new(19.0, 5.0)],
                color: Rgb(9, 9, 9),
                weight: 1,
            },
            clip,
        ));
        frame.overlays.push(Overlay::clipped(
            Primitive::Circle {
                center: Point2::new(10.0, 5.0),
                radius: 3.0,
                color: Rgb(7, 7, 7),
                weight: 1,
            },
            clip,
        ));
        rasterize(&mut frame);

        assert_eq!(frame.get(9, 5), Rgb::BLACK);
        assert_eq!(frame.get(7, 5), Rgb::BLACK);
        assert_eq!(frame.get(12, 5), Rgb(9, 9, 9));
        assert_eq!(frame.get(13, 5), Rgb(7, 7, 7));
        assert_eq!(frame.get(10, 2), Rgb(7, 7, 7));
    }
}
