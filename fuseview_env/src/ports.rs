//! Estimator and detector capability traits.

use crate::error::EnvError;
use crate::types::{CenterlineMeasurement, Detection, Estimate};
use image::GrayImage;

/// The predict/update contract of the motion/perception estimator.
///
/// # Determinism
///
/// Every method must be a pure function of its arguments. The session cursor
/// rewinds by restoring an old `Estimate` and re-running the cycle, which is
/// only exact if nothing is cached inside the implementation.
///
/// # Failure
///
/// Returning `Err` means "this step was rejected". The caller keeps the
/// estimate it passed in and carries on with the next step.
pub trait EstimatorPort {
    /// Prior used when a session starts.
    fn initial_estimate(&self) -> Estimate;

    /// Propagates the estimate forward by `dt` seconds.
    ///
    /// # Arguments
    /// * `throttle` - Normalized throttle command in [-1, 1]
    /// * `steering` - Normalized steering command in [-1, 1]
    fn predict(
        &self,
        estimate: &Estimate,
        dt: f64,
        throttle: f64,
        steering: f64,
    ) -> Result<Estimate, EnvError>;

    /// Fuses a lane centerline polynomial (and its noise covariance).
    fn update_centerline(
        &self,
        estimate: &Estimate,
        measurement: &CenterlineMeasurement,
    ) -> Result<Estimate, EnvError>;

    /// Fuses a yaw-rate reading in rad/s.
    fn update_yaw_rate(&self, estimate: &Estimate, yaw_rate: f64) -> Result<Estimate, EnvError>;

    /// Fuses the mean wheel-encoder rate (ticks/s) and the raw servo position.
    fn update_wheel_speed(
        &self,
        estimate: &Estimate,
        ticks_per_second: f64,
        servo: f64,
    ) -> Result<Estimate, EnvError>;
}

/// Extracts the lane centerline (and debug imagery) from a camera frame.
pub trait DetectorPort {
    /// Runs detection on one single-channel camera frame.
    ///
    /// A frame without a usable lane yields `centerline: None`; that is an
    /// expected outcome, never an error.
    fn detect(&self, frame: &GrayImage) -> Detection;
}

impl<T: EstimatorPort + ?Sized> EstimatorPort for &T {
    fn initial_estimate(&self) -> Estimate {
        (**self).initial_estimate()
    }

    fn predict(
        &self,
        estimate: &Estimate,
        dt: f64,
        throttle: f64,
        steering: f64,
    ) -> Result<Estimate, EnvError> {
        (**self).predict(estimate, dt, throttle, steering)
    }

    fn update_centerline(
        &self,
        estimate: &Estimate,
        measurement: &CenterlineMeasurement,
    ) -> Result<Estimate, EnvError> {
        (**self).update_centerline(estimate, measurement)
    }

    fn update_yaw_rate(&self, estimate: &Estimate, yaw_rate: f64) -> Result<Estimate, EnvError> {
        (**self).update_yaw_rate(estimate, yaw_rate)
    }

    fn update_wheel_speed(
        &self,
        estimate: &Estimate,
        ticks_per_second: f64,
        servo: f64,
    ) -> Result<Estimate, EnvError> {
        (**self).update_wheel_speed(estimate, ticks_per_second, servo)
    }
}

impl<T: DetectorPort + ?Sized> DetectorPort for &T {
    fn detect(&self, frame: &GrayImage) -> Detection {
        (**self).detect(frame)
    }
}
