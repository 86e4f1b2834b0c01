//! Reference lane-following EKF.
//!
//! State: `[v, delta, ye, psi_e, kappa, gyro_bias]`
//! - `v`: forward speed (m/s)
//! - `delta`: steering, as yaw rate per unit speed (rad/m)
//! - `ye`: lateral offset from the lane centre (m)
//! - `psi_e`: heading error relative to the lane (rad)
//! - `kappa`: lane curvature (1/m)
//! - `gyro_bias`: yaw gyro offset (rad/s)

use fuseview_env::{CenterlineMeasurement, EnvError, Estimate, EstimatorPort};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Number of state variables carried by [`LaneEkf`].
pub const STATE_DIM: usize = 6;

/// Model and noise parameters for [`LaneEkf`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EkfConfig {
    /// Prior standard deviation per state variable (state units)
    pub initial_std: [f64; STATE_DIM],

    /// Acceleration at full throttle (m/s^2)
    pub max_accel: f64,

    /// Linear drag on speed (1/s)
    pub drag: f64,

    /// Steering at full command (rad/m)
    pub max_delta: f64,

    /// Steering response time constant (s)
    pub steer_tau: f64,

    /// Process noise spectral density per state variable (state units^2 / s)
    pub process_noise: [f64; STATE_DIM],

    /// Yaw gyro noise (rad/s)
    pub gyro_std: f64,

    /// Distance travelled per encoder tick (m)
    pub metres_per_tick: f64,

    /// Wheel rate noise (ticks/s)
    pub tick_rate_std: f64,

    /// Servo reading at zero steering (raw units)
    pub servo_center: f64,

    /// Servo reading per unit steering (raw units per rad/m)
    pub servo_gain: f64,

    /// Servo reading noise (raw units)
    pub servo_std: f64,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            initial_std: [0.5, 0.3, 0.3, 0.3, 0.5, 0.05],
            max_accel: 4.0,
            drag: 1.0,
            max_delta: 0.8,
            steer_tau: 0.1,
            process_noise: [1.0, 0.5, 0.01, 0.01, 0.1, 1e-4],
            gyro_std: 0.05,
            // 20 ticks per revolution of a 104 mm wheel
            metres_per_tick: std::f64::consts::PI * 0.104 / 20.0,
            tick_rate_std: 20.0,
            servo_center: 127.0,
            servo_gain: 100.0,
            servo_std: 3.0,
        }
    }
}

/// Extended Kalman filter over the lane-relative bicycle model.
///
/// Stateless: every call maps an input [`Estimate`] to a new one.
#[derive(Debug, Clone, Default)]
pub struct LaneEkf {
    config: EkfConfig,
}

impl LaneEkf {
    pub fn new(config: EkfConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EkfConfig {
        &self.config
    }

    fn check_dim(estimate: &Estimate) -> Result<(), EnvError> {
        if estimate.dim() != STATE_DIM {
            return Err(EnvError::DimensionMismatch {
                expected: STATE_DIM,
                actual: estimate.dim(),
            });
        }
        Ok(())
    }

    /// Standard EKF correction with a Joseph-form covariance update.
    fn correct(
        estimate: &Estimate,
        innovation: DVector<f64>,
        h: DMatrix<f64>,
        r: DMatrix<f64>,
        name: &'static str,
    ) -> Result<Estimate, EnvError> {
        let p = &estimate.covariance;
        let hp = &h * p;
        let s = &hp * h.transpose() + &r;
        let s_chol = s.cholesky().ok_or(EnvError::SingularInnovation(name))?;

        // K = P H^T S^-1 = (S^-1 H P)^T with P and S symmetric
        let k = s_chol.solve(&hp).transpose();

        let state = &estimate.state + &k * innovation;
        let ikh = DMatrix::identity(STATE_DIM, STATE_DIM) - &k * &h;
        let covariance = &ikh * p * ikh.transpose() + &k * r * k.transpose();

        if state.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(EnvError::SingularInnovation(name));
        }
        Estimate::try_new(state, covariance)
    }
}

impl EstimatorPort for LaneEkf {
    fn initial_estimate(&self) -> Estimate {
        let variances = DVector::from_iterator(
            STATE_DIM,
            self.config.initial_std.iter().map(|s| s * s),
        );
        Estimate::from_variances(&variances)
    }

    fn predict(
        &self,
        estimate: &Estimate,
        dt: f64,
        throttle: f64,
        steering: f64,
    ) -> Result<Estimate, EnvError> {
        Self::check_dim(estimate)?;
        if !(dt.is_finite() && throttle.is_finite() && steering.is_finite()) {
            return Err(EnvError::NonFiniteMeasurement("predict"));
        }
        // Out-of-order or duplicate timestamps: nothing to propagate
        if dt <= 0.0 {
            return Ok(estimate.clone());
        }

        let c = &self.config;
        let x = &estimate.state;
        let (v, delta, ye, psi, kappa) = (x[0], x[1], x[2], x[3], x[4]);
        let (sin_psi, cos_psi) = psi.sin_cos();

        // Rate of the lane frame along the path
        let g = 1.0 - kappa * ye;
        let lane_turn = v * kappa * cos_psi / g;

        // Exact discretization of the first-order steering lag
        let alpha = 1.0 - (-dt / c.steer_tau).exp();

        let mut next = x.clone();
        next[0] = v + dt * (c.max_accel * throttle - c.drag * v);
        next[1] = delta + alpha * (c.max_delta * steering - delta);
        next[2] = ye + dt * v * sin_psi;
        next[3] = psi + dt * (v * delta - lane_turn);

        let mut f = DMatrix::identity(STATE_DIM, STATE_DIM);
        f[(0, 0)] = 1.0 - dt * c.drag;
        f[(1, 1)] = 1.0 - alpha;
        f[(2, 0)] = dt * sin_psi;
        f[(2, 3)] = dt * v * cos_psi;
        f[(3, 0)] = dt * (delta - kappa * cos_psi / g);
        f[(3, 1)] = dt * v;
        f[(3, 2)] = -dt * v * kappa * kappa * cos_psi / (g * g);
        f[(3, 3)] = 1.0 + dt * v * kappa * sin_psi / g;
        f[(3, 4)] = -dt * v * cos_psi / (g * g);

        let q = DMatrix::from_diagonal(&DVector::from_iterator(
            STATE_DIM,
            c.process_noise.iter().map(|n| n * dt),
        ));
        let covariance = &f * &estimate.covariance * f.transpose() + q;

        if next.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(EnvError::NonFiniteMeasurement("predict"));
        }
        Estimate::try_new(next, covariance)
    }

    fn update_centerline(
        &self,
        estimate: &Estimate,
        measurement: &CenterlineMeasurement,
    ) -> Result<Estimate, EnvError> {
        Self::check_dim(estimate)?;
        if !measurement.is_finite() {
            return Err(EnvError::NonFiniteMeasurement("centerline"));
        }

        let x = &estimate.state;
        let (ye, psi, kappa) = (x[2], x[3], x[4]);
        let t = psi.tan();
        let sec2 = 1.0 + t * t;
        let sec3 = sec2.powf(1.5);

        // x_lateral(y) = a y^2 + b y + c seen from the vehicle
        let predicted = DVector::from_vec(vec![0.5 * kappa * sec3, t, -ye]);
        let z = DVector::from_column_slice(measurement.coefficients.as_slice());

        let mut h = DMatrix::zeros(3, STATE_DIM);
        h[(0, 3)] = 1.5 * kappa * t * sec3;
        h[(0, 4)] = 0.5 * sec3;
        h[(1, 3)] = sec2;
        h[(2, 2)] = -1.0;

        let r = DMatrix::from_column_slice(3, 3, measurement.noise.as_slice());
        Self::correct(estimate, z - predicted, h, r, "centerline")
    }

    fn update_yaw_rate(&self, estimate: &Estimate, yaw_rate: f64) -> Result<Estimate, EnvError> {
        Self::check_dim(estimate)?;
        if !yaw_rate.is_finite() {
            return Err(EnvError::NonFiniteMeasurement("yaw_rate"));
        }

        let x = &estimate.state;
        let (v, delta, bias) = (x[0], x[1], x[5]);
        let predicted = v * delta + bias;

        let mut h = DMatrix::zeros(1, STATE_DIM);
        h[(0, 0)] = delta;
        h[(0, 1)] = v;
        h[(0, 5)] = 1.0;

        let r = DMatrix::from_element(1, 1, self.config.gyro_std.powi(2));
        Self::correct(
            estimate,
            DVector::from_element(1, yaw_rate - predicted),
            h,
            r,
            "yaw_rate",
        )
    }

    fn update_wheel_speed(
        &self,
        estimate: &Estimate,
        ticks_per_second: f64,
        servo: f64,
    ) -> Result<Estimate, EnvError> {
        Self::check_dim(estimate)?;
        if !(ticks_per_second.is_finite() && servo.is_finite()) {
            return Err(EnvError::NonFiniteMeasurement("wheel_speed"));
        }

        let c = &self.config;
        let x = &estimate.state;
        let predicted = DVector::from_vec(vec![
            x[0] / c.metres_per_tick,
            c.servo_center + c.servo_gain * x[1],
        ]);
        let z = DVector::from_vec(vec![ticks_per_second, servo]);

        let mut h = DMatrix::zeros(2, STATE_DIM);
        h[(0, 0)] = 1.0 / c.metres_per_tick;
        h[(1, 1)] = c.servo_gain;

        let r = DMatrix::from_diagonal(&DVector::from_vec(vec![
            c.tick_rate_std.powi(2),
            c.servo_std.powi(2),
        ]));
        Self::correct(estimate, z - predicted, h, r, "wheel_speed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    fn moving(v: f64) -> Estimate {
        let ekf = LaneEkf::default();
        let mut est = ekf.initial_estimate();
        est.state[0] = v;
        est
    }

    fn assert_symmetric(m: &DMatrix<f64>) {
        assert_relative_eq!(m.clone(), m.transpose(), epsilon = 1e-9);
    }

    #[test]
    fn test_initial_estimate_shape() {
        let est = LaneEkf::default().initial_estimate();
        assert_eq!(est.dim(), STATE_DIM);
        assert_relative_eq!(est.covariance[(0, 0)], 0.25);
        assert_relative_eq!(est.covariance[(5, 5)], 0.0025);
        assert!(est.state.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_predict_throttle_accelerates() {
        let ekf = LaneEkf::default();
        let est = ekf.initial_estimate();
        let next = ekf.predict(&est, 0.1, 1.0, 0.0).unwrap();

        assert_relative_eq!(next.state[0], 0.4, epsilon = 1e-12);
        // Uncertainty grows without measurements
        assert!(next.covariance.trace() > est.covariance.trace());
        assert_symmetric(&next.covariance);
    }

    #[test]
    fn test_predict_steering_lag() {
        let ekf = LaneEkf::default();
        let next = ekf.predict(&moving(1.0), 0.1, 0.0, 1.0).unwrap();
        let alpha = 1.0 - (-1.0f64).exp();
        assert_relative_eq!(next.state[1], alpha * 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_heading_error_drives_offset() {
        let ekf = LaneEkf::default();
        let mut est = moving(2.0);
        est.state[3] = 0.1;
        let next = ekf.predict(&est, 0.05, 0.0, 0.0).unwrap();
        assert_relative_eq!(next.state[2], 0.05 * 2.0 * 0.1f64.sin(), epsilon = 1e-12);
    }

    #[test]
    fn test_predict_non_positive_dt_is_identity() {
        let ekf = LaneEkf::default();
        let est = moving(1.5);
        assert_eq!(ekf.predict(&est, 0.0, 1.0, 1.0).unwrap(), est);
        assert_eq!(ekf.predict(&est, -0.2, 1.0, 1.0).unwrap(), est);
    }

    #[test]
    fn test_predict_rejects_nan() {
        let ekf = LaneEkf::default();
        let est = ekf.initial_estimate();
        assert!(matches!(
            ekf.predict(&est, f64::NAN, 0.0, 0.0),
            Err(EnvError::NonFiniteMeasurement("predict"))
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let ekf = LaneEkf::default();
        let est = Estimate::try_new(DVector::zeros(5), DMatrix::identity(5, 5)).unwrap();
        assert!(matches!(
            ekf.update_yaw_rate(&est, 0.0),
            Err(EnvError::DimensionMismatch { expected: 6, actual: 5 })
        ));
    }

    #[test]
    fn test_yaw_rate_update_learns_bias_when_stationary() {
        let ekf = LaneEkf::default();
        let est = ekf.initial_estimate();
        let next = ekf.update_yaw_rate(&est, 0.02).unwrap();

        assert!(next.state[5] > 0.0);
        assert!(next.covariance[(5, 5)] < est.covariance[(5, 5)]);
        assert_symmetric(&next.covariance);
    }

    #[test]
    fn test_centerline_update_pulls_offset() {
        let ekf = LaneEkf::default();
        let est = ekf.initial_estimate();
        let m = CenterlineMeasurement::new(Vector3::new(0.0, 0.0, 0.2), Matrix3::identity() * 1e-4);
        let next = ekf.update_centerline(&est, &m).unwrap();

        // c = -ye
        assert_relative_eq!(next.state[2], -0.2, epsilon = 1e-2);
        assert!(next.covariance[(2, 2)] < est.covariance[(2, 2)]);
    }

    #[test]
    fn test_centerline_update_recovers_curvature() {
        let ekf = LaneEkf::default();
        let est = ekf.initial_estimate();
        let m =
            CenterlineMeasurement::new(Vector3::new(0.25, 0.0, 0.0), Matrix3::identity() * 1e-6);
        let next = ekf.update_centerline(&est, &m).unwrap();
        assert_relative_eq!(next.state[4], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_centerline_rejects_non_finite() {
        let ekf = LaneEkf::default();
        let m = CenterlineMeasurement::new(Vector3::new(f64::NAN, 0.0, 0.0), Matrix3::identity());
        assert!(matches!(
            ekf.update_centerline(&ekf.initial_estimate(), &m),
            Err(EnvError::NonFiniteMeasurement("centerline"))
        ));
    }

    #[test]
    fn test_singular_innovation_rejected() {
        let ekf = LaneEkf::default();
        let m = CenterlineMeasurement::new(Vector3::zeros(), Matrix3::identity() * -10.0);
        assert!(matches!(
            ekf.update_centerline(&ekf.initial_estimate(), &m),
            Err(EnvError::SingularInnovation("centerline"))
        ));
    }

    #[test]
    fn test_wheel_speed_update() {
        let ekf = LaneEkf::default();
        let est = ekf.initial_estimate();
        let mpt = ekf.config().metres_per_tick;
        let next = ekf.update_wheel_speed(&est, 1.0 / mpt, 127.0).unwrap();

        // 1 m/s in ticks; prior and tick noise are of similar weight
        assert!(next.state[0] > 0.5 && next.state[0] < 1.0);
        assert!(next.covariance[(0, 0)] < est.covariance[(0, 0)]);
        assert_relative_eq!(next.state[1], 0.0, epsilon = 1e-12);
        assert_symmetric(&next.covariance);
    }
}
