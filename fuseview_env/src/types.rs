//! Common types crossing the FuseView capability interfaces.

use crate::error::EnvError;
use image::{GrayImage, ImageBuffer, Luma};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Ordered estimator state vector.
///
/// The first five entries are `[v (m/s), delta (rad), ye (m), psi_e (rad), kappa (1/m)]`;
/// anything after that is estimator-internal.
pub type EstimatorState = DVector<f64>;

/// Square covariance over the same index space as [`EstimatorState`].
pub type Covariance = DMatrix<f64>;

/// A (state, covariance) pair, moved through the estimator as one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub state: EstimatorState,
    pub covariance: Covariance,
}

impl Estimate {
    /// Creates an estimate, checking that the covariance is `n x n` for an `n`-state.
    pub fn try_new(state: EstimatorState, covariance: Covariance) -> Result<Self, EnvError> {
        let n = state.len();
        if covariance.nrows() != n {
            return Err(EnvError::DimensionMismatch {
                expected: n,
                actual: covariance.nrows(),
            });
        }
        if covariance.ncols() != n {
            return Err(EnvError::DimensionMismatch {
                expected: n,
                actual: covariance.ncols(),
            });
        }
        Ok(Self { state, covariance })
    }

    /// Zero state with an uncorrelated prior of the given variances.
    pub fn from_variances(variances: &DVector<f64>) -> Self {
        Self {
            state: DVector::zeros(variances.len()),
            covariance: DMatrix::from_diagonal(variances),
        }
    }

    /// Number of state variables.
    pub fn dim(&self) -> usize {
        self.state.len()
    }

    /// Leading `n` state entries (zero padded if the state is shorter).
    pub fn head(&self, n: usize) -> DVector<f64> {
        DVector::from_fn(n, |i, _| self.state.get(i).copied().unwrap_or(0.0))
    }

    /// Diagonal of the covariance (per-variable variance).
    pub fn variances(&self) -> DVector<f64> {
        self.covariance.diagonal()
    }
}

/// Quadratic lane centerline fit in metric birdseye coordinates.
///
/// `x_lateral(y) = a*y^2 + b*y + c` with `y` metres ahead of the vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CenterlineMeasurement {
    /// Polynomial coefficients `[a, b, c]`, highest degree first
    pub coefficients: Vector3<f64>,

    /// Measurement noise covariance of the coefficients
    pub noise: Matrix3<f64>,
}

impl CenterlineMeasurement {
    pub fn new(coefficients: Vector3<f64>, noise: Matrix3<f64>) -> Self {
        Self { coefficients, noise }
    }

    /// Evaluates the polynomial at `y` metres ahead.
    pub fn evaluate(&self, y: f64) -> f64 {
        let c = &self.coefficients;
        (c[0] * y + c[1]) * y + c[2]
    }

    /// Returns true if every coefficient and noise entry is finite.
    pub fn is_finite(&self) -> bool {
        self.coefficients.iter().all(|v| v.is_finite()) && self.noise.iter().all(|v| v.is_finite())
    }
}

/// Floating point single channel image (detector response).
pub type ResponseImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Largest value in a response image (0.0 when empty or nowhere positive).
pub fn peak_response(image: &ResponseImage) -> f32 {
    image.as_raw().iter().copied().fold(0.0, f32::max)
}

/// Everything the detector produces for one camera frame.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Birdseye horizontal-convolution response
    pub response: ResponseImage,

    /// Rectified (ReLU) response used as the annotated panel background
    pub birdseye: ResponseImage,

    /// Birdseye resample of the camera image
    pub mask: GrayImage,

    /// Fitted centerline, `None` when no lane was found this frame
    pub centerline: Option<CenterlineMeasurement>,
}

impl Detection {
    /// A detection with blank panels and no measurement.
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            response: ResponseImage::new(width, height),
            birdseye: ResponseImage::new(width, height),
            mask: GrayImage::new(width, height),
            centerline: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_centerline_evaluate() {
        let m = CenterlineMeasurement::new(Vector3::new(0.5, -1.0, 0.25), Matrix3::identity());
        assert_relative_eq!(m.evaluate(0.0), 0.25);
        assert_relative_eq!(m.evaluate(2.0), 0.5 * 4.0 - 2.0 + 0.25);
        assert!(m.is_finite());
    }

    #[test]
    fn test_estimate_head_pads_short_state() {
        let est =
            Estimate::try_new(DVector::from_vec(vec![1.0, 2.0]), DMatrix::identity(2, 2)).unwrap();
        let head = est.head(5);
        assert_eq!(head.as_slice(), &[1.0, 2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_estimate_rejects_mismatched_covariance() {
        let result = Estimate::try_new(DVector::zeros(5), DMatrix::identity(6, 6));
        assert!(matches!(
            result,
            Err(EnvError::DimensionMismatch { expected: 5, actual: 6 })
        ));
        let result = Estimate::try_new(DVector::zeros(3), DMatrix::zeros(3, 2));
        assert!(matches!(
            result,
            Err(EnvError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_prior_from_variances() {
        let prior = Estimate::from_variances(&DVector::from_vec(vec![4.0, 0.25]));
        assert_eq!(prior.dim(), 2);
        assert_eq!(prior.state.as_slice(), &[0.0, 0.0]);
        assert_eq!(prior.covariance[(1, 1)], 0.25);
        assert_eq!(prior.covariance[(0, 1)], 0.0);
    }

    #[test]
    fn test_peak_response_ignores_negatives() {
        let mut image = ResponseImage::new(3, 2);
        assert_eq!(peak_response(&image), 0.0);
        image.put_pixel(0, 0, Luma([-5.0]));
        image.put_pixel(2, 1, Luma([3.5]));
        assert_eq!(peak_response(&image), 3.5);
    }

    #[test]
    fn test_empty_detection_panels() {
        let detection = Detection::empty(80, 60);
        assert_eq!(detection.mask.dimensions(), (80, 60));
        assert_eq!(detection.response.dimensions(), (80, 60));
        assert!(detection.birdseye.as_raw().iter().all(|r| *r == 0.0));
        assert!(detection.centerline.is_none());
    }
}
