//! Reference centerline detector.
//!
//! 1. Resample the camera image onto a metric ground grid (flat-ground pinhole).
//! 2. Horizontal convolution with `[-1, -1, 2, 2, -1, -1]` (bright stripe ~2 cells wide).
//! 3. ReLU, then per-row weighted centroids.
//! 4. Weighted least squares quadratic `x = a*y^2 + b*y + c` over the centroids.
//!
//! Grid row 0 is the row nearest the vehicle; column `W/2` is straight ahead.

use fuseview_env::{CenterlineMeasurement, Detection, DetectorPort, GrayImage, ResponseImage};
use image::Luma;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Stripe detection kernel.
pub const KERNEL: [f32; 6] = [-1.0, -1.0, 2.0, 2.0, -1.0, -1.0];

/// Coverage value of a birdseye cell that the camera sees.
pub const IN_VIEW: u8 = 255;

/// Forward camera over flat ground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    /// Lens height above ground (m)
    pub height: f64,

    /// Downward tilt of the optical axis (rad)
    pub pitch: f64,

    /// Focal length (pixels)
    pub focal_px: f64,

    /// Principal point (pixels)
    pub cx: f64,
    pub cy: f64,
}

impl Default for CameraModel {
    fn default() -> Self {
        Self {
            height: 0.15,
            pitch: 0.25,
            focal_px: 180.0,
            cx: 160.0,
            cy: 70.0,
        }
    }
}

impl CameraModel {
    /// Image position `(u, v)` of ground point `(x lateral, y forward)`.
    ///
    /// `None` for points behind the image plane.
    pub fn project(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (sin_p, cos_p) = self.pitch.sin_cos();
        let depth = y * cos_p + self.height * sin_p;
        if depth <= 1e-6 {
            return None;
        }
        let down = -y * sin_p + self.height * cos_p;
        Some((
            self.cx + self.focal_px * x / depth,
            self.cy + self.focal_px * down / depth,
        ))
    }

    /// Ground point seen at pixel `(u, v)`; `None` at or above the horizon.
    pub fn ground_point(&self, u: f64, v: f64) -> Option<(f64, f64)> {
        let (sin_p, cos_p) = self.pitch.sin_cos();
        let xn = (u - self.cx) / self.focal_px;
        let yn = (v - self.cy) / self.focal_px;
        let descent = yn * cos_p + sin_p;
        if descent <= 1e-6 {
            return None;
        }
        let t = self.height / descent;
        Some((t * xn, t * (cos_p - yn * sin_p)))
    }

    /// Renders a `width x height` image by shading the ground point under each pixel.
    ///
    /// Pixels above the horizon get `sky`.
    pub fn render_ground(
        &self,
        width: u32,
        height: u32,
        sky: u8,
        shade: impl Fn(f64, f64) -> u8,
    ) -> GrayImage {
        GrayImage::from_fn(width, height, |u, v| {
            match self.ground_point(u as f64 + 0.5, v as f64 + 0.5) {
                Some((x, y)) => Luma([shade(x, y)]),
                None => Luma([sky]),
            }
        })
    }
}

/// Birdseye grid and fit parameters for [`ConvolutionDetector`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BirdseyeConfig {
    /// Grid columns (cells)
    pub grid_width: u32,

    /// Grid rows (cells)
    pub grid_height: u32,

    /// Cell size (m)
    pub metres_per_cell: f64,

    pub camera: CameraModel,

    /// Minimum summed ReLU response for a row to count
    pub min_row_response: f32,

    /// Minimum supporting rows for a fit
    pub min_rows: usize,

    /// Lateral centroid noise variance (m^2)
    pub centroid_variance: f64,
}

impl Default for BirdseyeConfig {
    fn default() -> Self {
        Self {
            grid_width: 80,
            grid_height: 60,
            metres_per_cell: 0.025,
            camera: CameraModel::default(),
            min_row_response: 200.0,
            min_rows: 8,
            centroid_variance: 4e-4,
        }
    }
}

impl BirdseyeConfig {
    /// Lateral metres of grid column `i` (cell centre).
    pub fn column_x(&self, i: f64) -> f64 {
        (i + 0.5 - self.grid_width as f64 / 2.0) * self.metres_per_cell
    }

    /// Forward metres of grid row `j` (cell centre).
    pub fn row_y(&self, j: u32) -> f64 {
        (j as f64 + 0.5) * self.metres_per_cell
    }
}

/// Convolution + quadratic-fit lane detector.
#[derive(Debug, Clone, Default)]
pub struct ConvolutionDetector {
    config: BirdseyeConfig,
}

impl ConvolutionDetector {
    pub fn new(config: BirdseyeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BirdseyeConfig {
        &self.config
    }

    /// Nearest-pixel ground resample of `frame`.
    ///
    /// Returns the mask plus a same-sized coverage grid, [`IN_VIEW`] where the
    /// cell fell inside the image and 0 elsewhere. Cells outside the view are
    /// 0 in the mask.
    pub fn birdseye(&self, frame: &GrayImage) -> (GrayImage, GrayImage) {
        let c = &self.config;
        let mut mask = GrayImage::new(c.grid_width, c.grid_height);
        let mut coverage = GrayImage::new(c.grid_width, c.grid_height);
        for j in 0..c.grid_height {
            let y = c.row_y(j);
            for i in 0..c.grid_width {
                let Some((u, v)) = c.camera.project(c.column_x(i as f64), y) else {
                    continue;
                };
                let (u, v) = (u.floor(), v.floor());
                if u >= 0.0 && v >= 0.0 && u < frame.width() as f64 && v < frame.height() as f64 {
                    mask.put_pixel(i, j, *frame.get_pixel(u as u32, v as u32));
                    coverage.put_pixel(i, j, Luma([IN_VIEW]));
                }
            }
        }
        (mask, coverage)
    }

    /// Row-wise convolution with [`KERNEL`].
    ///
    /// Output column `i` covers mask columns `i-2..=i+3`, so it is centred on
    /// the boundary between cells `i` and `i+1`. Columns where the kernel
    /// does not fit, or touches a cell outside the view, are 0.
    pub fn convolve(&self, mask: &GrayImage, coverage: &GrayImage) -> ResponseImage {
        let mut response = ResponseImage::new(mask.width(), mask.height());
        let width = mask.width() as usize;
        if width < KERNEL.len() || coverage.dimensions() != mask.dimensions() {
            return response;
        }
        let rows = mask.as_raw().chunks_exact(width);
        let valid_rows = coverage.as_raw().chunks_exact(width);
        for (j, (row, valid)) in rows.zip(valid_rows).enumerate() {
            for i in 2..width - 3 {
                if !valid[i - 2..=i + 3].iter().all(|v| *v == IN_VIEW) {
                    continue;
                }
                let sum: f32 = KERNEL
                    .iter()
                    .zip(&row[i - 2..=i + 3])
                    .map(|(k, p)| k * *p as f32)
                    .sum();
                response.put_pixel(i as u32, j as u32, Luma([sum]));
            }
        }
        response
    }

    /// Weighted quadratic fit over per-row centroids of the rectified response.
    pub fn fit_centerline(&self, rectified: &ResponseImage) -> Option<CenterlineMeasurement> {
        let c = &self.config;
        let mut rows = Vec::new();
        for (j, row) in rectified.enumerate_rows() {
            let mut weight = 0.0f64;
            let mut moment = 0.0f64;
            for (i, _, r) in row {
                let r = r[0] as f64;
                weight += r;
                // Response columns sit half a cell to the right of mask columns
                moment += r * c.column_x(i as f64 + 0.5);
            }
            if weight > 0.0 && weight >= c.min_row_response as f64 {
                rows.push((c.row_y(j), moment / weight, weight));
            }
        }

        if rows.len() < c.min_rows.max(3) {
            trace!(rows = rows.len(), "too few supporting rows for a centerline fit");
            return None;
        }

        let mean_weight = rows.iter().map(|r| r.2).sum::<f64>() / rows.len() as f64;
        let mut normal = Matrix3::zeros();
        let mut rhs = Vector3::zeros();
        for &(y, x, w) in &rows {
            let basis = Vector3::new(y * y, y, 1.0);
            let w = w / mean_weight;
            normal += basis * basis.transpose() * w;
            rhs += basis * (w * x);
        }

        let chol = normal.cholesky()?;
        let coefficients = chol.solve(&rhs);
        let noise = chol.inverse() * c.centroid_variance;

        let measurement = CenterlineMeasurement::new(coefficients, noise);
        measurement.is_finite().then_some(measurement)
    }
}

impl DetectorPort for ConvolutionDetector {
    fn detect(&self, frame: &GrayImage) -> Detection {
        let (mask, coverage) = self.birdseye(frame);
        let response = self.convolve(&mask, &coverage);
        let mut birdseye = response.clone();
        for r in birdseye.pixels_mut() {
            r[0] = r[0].max(0.0);
        }
        let centerline = self.fit_centerline(&birdseye);

        Detection {
            response,
            birdseye,
            mask,
            centerline,
        }
    }
}
