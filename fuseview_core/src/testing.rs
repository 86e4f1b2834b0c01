//! Deterministic port doubles and record builders for tests.
//!
//! Compiled unconditionally so the replay crate's tests can drive a full
//! session without a real estimator or camera.

use crate::telemetry::{RecordLayout, TelemetryRecord};
use fuseview_env::{
    CenterlineMeasurement, Detection, DetectorPort, EnvError, Estimate, EstimatorPort, GrayImage,
};
use nalgebra::{DVector, Matrix3, Vector3};
use std::cell::RefCell;

/// Small record geometry used throughout the tests.
pub const TEST_LAYOUT: RecordLayout = RecordLayout {
    image_width: 8,
    image_height: 4,
};

/// A record at time `t` seconds with the given wheel counters.
pub fn test_record(frame_id: u32, t: f64, wheel_ticks: [u16; 4]) -> TelemetryRecord {
    let time_sec = t.floor();
    TelemetryRecord {
        frame_id,
        time_sec: time_sec as u32,
        time_usec: ((t - time_sec) * 1_000_000.0).round() as u32,
        throttle: 32,
        steering: -16,
        accel: [0.0, 0.0, 9.81],
        gyro: [0.0, 0.0, 0.05],
        servo: 120,
        wheel_ticks,
        wheel_aux: [0; 4],
        image: test_image(frame_id),
    }
}

/// Encoded log of `frames` records at 30 Hz with steadily advancing wheels.
pub fn test_log(frames: u32) -> Vec<u8> {
    (0..frames)
        .flat_map(|i| {
            let ticks = (i * 3) as u16;
            let mut record = test_record(i, 100.0 + i as f64 / 30.0, [ticks; 4]);
            record.gyro[2] = 0.01 * i as f32;
            record.encode()
        })
        .collect()
}

/// Deterministic 8x4 gradient, shifted by `seed`.
pub fn test_image(seed: u32) -> GrayImage {
    let w = TEST_LAYOUT.image_width;
    let h = TEST_LAYOUT.image_height;
    GrayImage::from_fn(w, h, |x, y| image::Luma([((y * w + x) * 7 + seed) as u8]))
}

/// Detector returning blank panels and a fixed (or no) centerline.
#[derive(Debug, Clone)]
pub struct FixedDetector {
    pub centerline: Option<CenterlineMeasurement>,
}

impl FixedDetector {
    pub fn none() -> Self {
        Self { centerline: None }
    }

    /// A gentle curve starting 5 cm right of the vehicle.
    pub fn lane() -> Self {
        Self {
            centerline: Some(CenterlineMeasurement::new(
                Vector3::new(0.05, 0.02, 0.05),
                Matrix3::identity() * 1e-3,
            )),
        }
    }
}

impl DetectorPort for FixedDetector {
    fn detect(&self, frame: &GrayImage) -> Detection {
        let mut detection = Detection::empty(frame.width(), frame.height());
        detection.centerline = self.centerline.clone();
        detection
    }
}

/// Toy estimator that logs which operations ran.
///
/// Each operation nudges one state entry so tests can tell steps apart.
/// Non-finite inputs are rejected like a real filter would.
#[derive(Debug, Default)]
pub struct RecordingEstimator {
    calls: RefCell<Vec<&'static str>>,
    last_wheel_rate: RefCell<Option<f64>>,
}

impl RecordingEstimator {
    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    pub fn last_wheel_rate(&self) -> Option<f64> {
        *self.last_wheel_rate.borrow()
    }

    fn record(
        &self,
        name: &'static str,
        estimate: &Estimate,
        index: usize,
        delta: f64,
    ) -> Result<Estimate, EnvError> {
        self.calls.borrow_mut().push(name);
        if !delta.is_finite() {
            return Err(EnvError::NonFiniteMeasurement(name));
        }
        let mut next = estimate.clone();
        next.state[index] += delta;
        Ok(next)
    }
}

impl EstimatorPort for RecordingEstimator {
    fn initial_estimate(&self) -> Estimate {
        Estimate::from_variances(&DVector::from_element(6, 0.1))
    }

    fn predict(
        &self,
        estimate: &Estimate,
        dt: f64,
        throttle: f64,
        _steering: f64,
    ) -> Result<Estimate, EnvError> {
        self.record("predict", estimate, 0, dt * throttle)
    }

    fn update_centerline(
        &self,
        estimate: &Estimate,
        measurement: &CenterlineMeasurement,
    ) -> Result<Estimate, EnvError> {
        self.record("centerline", estimate, 2, -measurement.coefficients[2] * 0.5)
    }

    fn update_yaw_rate(&self, estimate: &Estimate, yaw_rate: f64) -> Result<Estimate, EnvError> {
        self.record("yaw_rate", estimate, 5, yaw_rate * 0.1)
    }

    fn update_wheel_speed(
        &self,
        estimate: &Estimate,
        ticks_per_second: f64,
        _servo: f64,
    ) -> Result<Estimate, EnvError> {
        *self.last_wheel_rate.borrow_mut() = Some(ticks_per_second);
        self.record("wheel_speed", estimate, 0, ticks_per_second * 1e-3)
    }
}
