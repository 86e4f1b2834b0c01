//! Geometric projection of state and covariance into the annotated panel.
//!
//! Metric coordinates are vehicle-relative: `x` lateral (right positive),
//! `y` forward. A panel of `W x H` pixels with `cell` pixels per birdseye cell
//! of `m` metres maps `(x, y)` to `(W/2 + x/m*cell, H - y/m*cell)`, so the
//! vehicle sits at the bottom centre.

use fuseview_env::{CenterlineMeasurement, Estimate, Primitive, Rgb};
use nalgebra::{DVector, Matrix5, Point2, RowVector5};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of visualized state variables.
pub const VISUAL_DIM: usize = 5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProjectionError {
    /// Leading covariance block has a negative eigenvalue
    #[error("Covariance is not positive semi-definite (min eigenvalue {min_eigenvalue:.3e})")]
    NonPositiveSemiDefinite { min_eigenvalue: f64 },

    #[error("Covariance contains non-finite entries")]
    NonFiniteCovariance,

    #[error("Covariance is {dim}x{dim}, need at least 5x5")]
    CovarianceTooSmall { dim: usize },
}

/// Configuration for the GeometricProjector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// Birdseye cell size (metres)
    pub metres_per_cell: f64,

    /// Curvature below which no arc is drawn (1/m)
    pub curvature_epsilon: f64,

    /// Number of kinematic preview sub-steps
    pub preview_steps: usize,

    /// Preview sub-step length (seconds)
    pub preview_dt: f64,

    /// Line weight of the mean state (pixels)
    pub mean_weight: u32,

    /// Line weight of each perturbed state (pixels)
    pub fan_weight: u32,

    /// Line weight of the measured centerline (pixels)
    pub measurement_weight: u32,

    /// Relative eigenvalue tolerance when the Cholesky factorization fails
    pub psd_tolerance: f64,

    pub arc_color: Rgb,
    pub trajectory_color: Rgb,
    pub measurement_color: Rgb,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            metres_per_cell: 0.025,
            curvature_epsilon: 1e-4,
            preview_steps: 3,
            preview_dt: 1.0 / 30.0,
            mean_weight: 2,
            fan_weight: 1,
            measurement_weight: 1,
            psd_tolerance: 1e-9,
            arc_color: Rgb(0, 255, 255),
            trajectory_color: Rgb(255, 180, 0),
            measurement_color: Rgb(0, 255, 0),
        }
    }
}

/// Pixel geometry of the annotated panel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelGeometry {
    pub width: f64,
    pub height: f64,

    /// Pixels per birdseye cell
    pub cell_px: f64,
}

impl PanelGeometry {
    /// Number of whole birdseye rows the panel covers.
    pub fn rows(&self) -> usize {
        (self.height / self.cell_px).floor().max(0.0) as usize
    }

    /// Metric `(x, y)` to panel pixels.
    pub fn to_pixel(&self, x: f64, y: f64, metres_per_cell: f64) -> Point2<f64> {
        Point2::new(
            self.width / 2.0 + x / metres_per_cell * self.cell_px,
            self.height - y / metres_per_cell * self.cell_px,
        )
    }
}

/// The visualized part of the state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualState {
    pub v: f64,
    pub delta: f64,
    pub ye: f64,
    pub psi_e: f64,
    pub kappa: f64,
}

impl VisualState {
    pub fn from_row(row: &RowVector5<f64>) -> Self {
        Self {
            v: row[0],
            delta: row[1],
            ye: row[2],
            psi_e: row[3],
            kappa: row[4],
        }
    }

    pub fn from_state(state: &DVector<f64>) -> Self {
        let at = |i: usize| state.get(i).copied().unwrap_or(0.0);
        Self::from_row(&RowVector5::new(at(0), at(1), at(2), at(3), at(4)))
    }

    pub fn as_row(&self) -> RowVector5<f64> {
        RowVector5::new(self.v, self.delta, self.ye, self.psi_e, self.kappa)
    }
}

/// Primitives for one annotated panel.
#[derive(Debug, Clone)]
pub struct AnnotatedPanel {
    pub primitives: Vec<Primitive>,

    /// Outcome of the uncertainty fan; on error the fan is simply absent
    pub fan: Result<(), ProjectionError>,
}

/// Maps estimator quantities to panel drawing primitives.
#[derive(Debug, Clone, Default)]
pub struct GeometricProjector {
    config: ProjectorConfig,
}

impl GeometricProjector {
    pub fn new(config: ProjectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// Circle of the lane path implied by `(ye, psi_e, kappa)`, if curved enough.
    pub fn curvature_arc(
        &self,
        state: &VisualState,
        panel: &PanelGeometry,
        weight: u32,
    ) -> Option<Primitive> {
        if state.kappa.abs() <= self.config.curvature_epsilon {
            return None;
        }
        let m = self.config.metres_per_cell;
        let rr = 1.0 / state.kappa - state.ye;
        let (sin_psi, cos_psi) = state.psi_e.sin_cos();

        Some(Primitive::Circle {
            center: panel.to_pixel(rr * cos_psi, -rr * sin_psi, m),
            radius: 1.0 / state.kappa.abs() / m * panel.cell_px,
            color: self.config.arc_color,
            weight,
        })
    }

    /// Short kinematic rollout from the vehicle origin using `(v, delta)`.
    pub fn trajectory(&self, state: &VisualState, panel: &PanelGeometry, weight: u32) -> Primitive {
        let m = self.config.metres_per_cell;
        let dt = self.config.preview_dt;
        let (mut x, mut y, mut theta) = (0.0f64, 0.0f64, 0.0f64);

        let mut points = Vec::with_capacity(self.config.preview_steps + 1);
        points.push(panel.to_pixel(x, y, m));
        for _ in 0..self.config.preview_steps {
            // Midpoint heading over the sub-step
            let theta_mid = theta + dt * state.delta / 2.0;
            theta += dt * state.delta;
            y += state.v * dt * theta_mid.cos();
            x += state.v * dt * theta_mid.sin();
            points.push(panel.to_pixel(x, y, m));
        }

        Primitive::Polyline {
            points,
            color: self.config.trajectory_color,
            weight,
        }
    }

    /// Arc (when curved) followed by the trajectory preview.
    pub fn project_state(
        &self,
        state: &VisualState,
        panel: &PanelGeometry,
        weight: u32,
    ) -> Vec<Primitive> {
        let mut out = Vec::with_capacity(2);
        out.extend(self.curvature_arc(state, panel, weight));
        out.push(self.trajectory(state, panel, weight));
        out
    }

    /// The measured centerline sampled once per birdseye row.
    pub fn measurement(
        &self,
        measurement: &CenterlineMeasurement,
        panel: &PanelGeometry,
    ) -> Primitive {
        let m = self.config.metres_per_cell;
        let points = (0..=panel.rows())
            .map(|i| {
                let y = i as f64 * m;
                panel.to_pixel(measurement.evaluate(y), y, m)
            })
            .collect();

        Primitive::Polyline {
            points,
            color: self.config.measurement_color,
            weight: self.config.measurement_weight,
        }
    }

    /// Square-root factor `U` of the leading 5x5 covariance block, `P = U^T U`.
    ///
    /// Rows of `U` are the fan directions. Cholesky is tried first; a PSD but
    /// singular block falls back to a scaled eigenbasis.
    pub fn factor(
        &self,
        covariance: &nalgebra::DMatrix<f64>,
    ) -> Result<Matrix5<f64>, ProjectionError> {
        let dim = covariance.nrows().min(covariance.ncols());
        if dim < VISUAL_DIM {
            return Err(ProjectionError::CovarianceTooSmall { dim });
        }

        let block = Matrix5::from_fn(|i, j| covariance[(i, j)]);
        if block.iter().any(|v| !v.is_finite()) {
            return Err(ProjectionError::NonFiniteCovariance);
        }
        let block = (block + block.transpose()) * 0.5;

        if let Some(chol) = block.cholesky() {
            return Ok(chol.l().transpose());
        }

        let eigen = block.symmetric_eigen();
        let min_eigenvalue = eigen.eigenvalues.min();
        let scale = eigen.eigenvalues.amax().max(1.0);
        if min_eigenvalue < -self.config.psd_tolerance * scale {
            return Err(ProjectionError::NonPositiveSemiDefinite { min_eigenvalue });
        }

        let mut u = Matrix5::zeros();
        for i in 0..VISUAL_DIM {
            let sigma = eigen.eigenvalues[i].max(0.0).sqrt();
            u.set_row(i, &(eigen.eigenvectors.column(i).transpose() * sigma));
        }
        Ok(u)
    }

    /// Mean plus `mean +/- U[i]` for each factor row (ten perturbed renders).
    pub fn uncertainty_fan(
        &self,
        estimate: &Estimate,
        panel: &PanelGeometry,
    ) -> Result<Vec<Primitive>, ProjectionError> {
        let u = self.factor(&estimate.covariance)?;
        let mean = VisualState::from_state(&estimate.state).as_row();

        let mut out = Vec::new();
        for i in 0..VISUAL_DIM {
            for sign in [1.0, -1.0] {
                let perturbed = VisualState::from_row(&(mean + u.row(i) * sign));
                out.extend(self.project_state(&perturbed, panel, self.config.fan_weight));
            }
        }
        Ok(out)
    }

    /// Everything drawn on the annotated panel for one cycle.
    ///
    /// A failed fan is reported in `fan`; the measurement and mean state are
    /// still produced.
    pub fn annotate(
        &self,
        estimate: &Estimate,
        measurement: Option<&CenterlineMeasurement>,
        panel: &PanelGeometry,
    ) -> AnnotatedPanel {
        let mut primitives = Vec::new();
        if let Some(measurement) = measurement {
            primitives.push(self.measurement(measurement, panel));
        }

        let mean = VisualState::from_state(&estimate.state);
        primitives.extend(self.project_state(&mean, panel, self.config.mean_weight));

        let fan = self.uncertainty_fan(estimate, panel).map(|renders| {
            primitives.extend(renders);
        });

        AnnotatedPanel { primitives, fan }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, Matrix3, Vector3};

    const PANEL: PanelGeometry = PanelGeometry {
        width: 320.0,
        height: 240.0,
        cell_px: 4.0,
    };

    fn state(v: f64, delta: f64, ye: f64, psi_e: f64, kappa: f64) -> VisualState {
        VisualState { v, delta, ye, psi_e, kappa }
    }

    fn estimate_with(cov_diag: &[f64]) -> Estimate {
        Estimate::from_variances(&DVector::from_column_slice(cov_diag))
    }

    #[test]
    fn test_zero_state_projects_to_origin() {
        let projector = GeometricProjector::default();
        let zero = state(0.0, 0.0, 0.0, 0.0, 0.0);

        let prims = projector.project_state(&zero, &PANEL, 2);
        assert_eq!(prims.len(), 1, "no arc for a straight path");
        match &prims[0] {
            Primitive::Polyline { points, .. } => {
                assert_eq!(points.len(), 4);
                for p in points {
                    assert_relative_eq!(p.x, 160.0);
                    assert_relative_eq!(p.y, 240.0);
                }
            }
            other => panic!("expected polyline, got {:?}", other),
        }
    }

    #[test]
    fn test_arc_radius() {
        let projector = GeometricProjector::default();
        let arc = projector
            .curvature_arc(&state(0.0, 0.0, 0.0, 0.0, 0.1), &PANEL, 1)
            .unwrap();
        match arc {
            Primitive::Circle { center, radius, .. } => {
                // 10 m radius at 0.025 m/cell and 4 px/cell
                assert_relative_eq!(radius, 1600.0, epsilon = 1e-9);
                assert_relative_eq!(center.x, 160.0 + 1600.0, epsilon = 1e-9);
                assert_relative_eq!(center.y, 240.0, epsilon = 1e-9);
            }
            other => panic!("expected circle, got {:?}", other),
        }
    }

    #[test]
    fn test_arc_threshold() {
        let projector = GeometricProjector::default();
        assert!(projector.curvature_arc(&state(0.0, 0.0, 0.0, 0.0, 1e-4), &PANEL, 1).is_none());
        assert!(projector.curvature_arc(&state(0.0, 0.0, 0.0, 0.0, -2e-4), &PANEL, 1).is_some());
    }

    #[test]
    fn test_straight_trajectory_length() {
        let projector = GeometricProjector::default();
        let prim = projector.trajectory(&state(3.0, 0.0, 0.0, 0.0, 0.0), &PANEL, 2);
        if let Primitive::Polyline { points, .. } = prim {
            let end = points.last().unwrap();
            // 3 m/s for 0.1 s = 0.3 m = 12 cells = 48 px
            assert_relative_eq!(end.x, 160.0, epsilon = 1e-9);
            assert_relative_eq!(end.y, 240.0 - 48.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_measurement_samples_every_row() {
        let projector = GeometricProjector::default();
        let m = CenterlineMeasurement::new(Vector3::new(0.0, 0.0, 0.1), Matrix3::identity());
        match projector.measurement(&m, &PANEL) {
            Primitive::Polyline { points, .. } => {
                assert_eq!(points.len(), PANEL.rows() + 1);
                // 0.1 m right = 4 cells = 16 px
                assert_relative_eq!(points[0].x, 176.0, epsilon = 1e-9);
                assert_relative_eq!(points[0].y, 240.0);
                assert_relative_eq!(points.last().unwrap().y, 0.0, epsilon = 1e-9);
            }
            other => panic!("expected polyline, got {:?}", other),
        }
    }

    #[test]
    fn test_factor_reconstructs_covariance() {
        let projector = GeometricProjector::default();
        let diag = DVector::from_column_slice(&[4.0, 1.0, 0.25, 0.5, 2.0, 9.0]);
        let mut p = DMatrix::from_diagonal(&diag);
        p[(0, 1)] = 0.5;
        p[(1, 0)] = 0.5;

        let u = projector.factor(&p).unwrap();
        let block = Matrix5::from_fn(|i, j| p[(i, j)]);
        assert_relative_eq!(u.transpose() * u, block, epsilon = 1e-12);
    }

    #[test]
    fn test_factor_accepts_singular_psd() {
        let projector = GeometricProjector::default();
        let p = estimate_with(&[1.0, 0.0, 1.0, 1.0, 1.0]).covariance;
        let u = projector.factor(&p).unwrap();
        let block = Matrix5::from_fn(|i, j| p[(i, j)]);
        assert_relative_eq!(u.transpose() * u, block, epsilon = 1e-9);
    }

    #[test]
    fn test_factor_rejects_negative_eigenvalue() {
        let projector = GeometricProjector::default();
        let p = estimate_with(&[1.0, 1.0, 1.0, 1.0, -0.5]).covariance;
        match projector.factor(&p) {
            Err(ProjectionError::NonPositiveSemiDefinite { min_eigenvalue }) => {
                assert_relative_eq!(min_eigenvalue, -0.5, epsilon = 1e-9);
            }
            other => panic!("expected NonPositiveSemiDefinite, got {:?}", other),
        }
    }

    #[test]
    fn test_factor_rejects_small_covariance() {
        let projector = GeometricProjector::default();
        let p = DMatrix::identity(3, 3);
        assert_eq!(
            projector.factor(&p),
            Err(ProjectionError::CovarianceTooSmall { dim: 3 })
        );
    }

    #[test]
    fn test_fan_has_ten_perturbed_renders() {
        let projector = GeometricProjector::default();
        // Straight, so each render is a single trajectory
        let est = estimate_with(&[0.01, 0.01, 0.01, 0.01, 0.0]);
        let fan = projector.uncertainty_fan(&est, &PANEL).unwrap();
        assert_eq!(fan.len(), 10);
        assert!(fan.iter().all(|p| p.weight() == 1));
    }

    #[test]
    fn test_annotate_without_fan_keeps_other_primitives() {
        let projector = GeometricProjector::default();
        let est = estimate_with(&[1.0, 1.0, 1.0, 1.0, -1.0]);
        let m = CenterlineMeasurement::new(Vector3::zeros(), Matrix3::identity());

        let panel = projector.annotate(&est, Some(&m), &PANEL);
        assert!(matches!(panel.fan, Err(ProjectionError::NonPositiveSemiDefinite { .. })));
        // Measurement plus mean trajectory
        assert_eq!(panel.primitives.len(), 2);
        assert_eq!(panel.primitives[1].weight(), 2);
    }
}
