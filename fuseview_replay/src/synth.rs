//! Deterministic synthetic drive logs.
//!
//! A vehicle follows a lane of slowly varying curvature under a simple
//! lane-keeping controller. The ground truth evolves with the same motion
//! model the lane EKF assumes, and every sensor is derived from it with
//! seeded noise, so the same seed always writes the same bytes.

use crate::config::ReplayConfig;
use fuseview_core::{TelemetryError, TelemetryRecord, TelemetryWriter};
use fuseview_env::GrayImage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Unix time of the first synthetic frame (s).
pub const SYNTH_EPOCH: f64 = 1.5e9;

/// Configuration for the LaneSimulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthConfig {
    /// Record rate (Hz)
    pub frame_rate: f64,

    /// Cruise speed the throttle controller holds (m/s)
    pub target_speed: f64,

    /// Peak lane curvature (1/m)
    pub curvature_amplitude: f64,

    /// Distance over which the curvature completes one cycle (m)
    pub curvature_wavelength: f64,

    /// Painted stripe width (m)
    pub stripe_width: f64,

    /// Lateral offset at the start (m)
    pub initial_offset: f64,

    /// Heading/offset feedback gains of the lane keeper
    pub heading_gain: f64,
    pub offset_gain: f64,

    /// Camera pixel noise (gray levels); the detector's ReLU turns it into a
    /// bias toward the image centre, so keep it small
    pub pixel_noise_std: f64,

    /// Yaw gyro white noise (rad/s)
    pub gyro_noise_std: f64,

    /// Largest gyro bias drawn per log (rad/s)
    pub gyro_bias_max: f64,

    /// Accelerometer noise (m/s^2)
    pub accel_noise_std: f64,

    /// Relative spread of per-wheel distance (slip, tyre size)
    pub wheel_slip_std: f64,

    /// Servo reading noise (raw units)
    pub servo_noise_std: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30.0,
            target_speed: 1.5,
            curvature_amplitude: 0.6,
            curvature_wavelength: 12.0,
            stripe_width: 0.05,
            initial_offset: 0.1,
            heading_gain: 2.0,
            offset_gain: 2.0,
            pixel_noise_std: 1.0,
            gyro_noise_std: 0.02,
            gyro_bias_max: 0.02,
            accel_noise_std: 0.1,
            wheel_slip_std: 0.02,
            servo_noise_std: 1.0,
        }
    }
}

/// Ground-truth vehicle state in lane coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TruthState {
    pub v: f64,
    pub delta: f64,
    pub ye: f64,
    pub psi_e: f64,
    pub kappa: f64,

    /// Distance travelled along the path (m)
    pub distance: f64,
}

impl TruthState {
    /// Lane centerline as `x = a*y^2 + b*y + c` in the vehicle frame.
    pub fn centerline(&self) -> [f64; 3] {
        let sec = 1.0 / self.psi_e.cos();
        [
            0.5 * self.kappa * sec * sec * sec,
            self.psi_e.tan(),
            -self.ye,
        ]
    }
}

/// Zero-mean normal sample with standard deviation `std`.
fn gaussian(rng: &mut ChaCha8Rng, std: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    std * z
}

/// Generates telemetry records one frame at a time.
pub struct LaneSimulator {
    config: SynthConfig,
    replay: ReplayConfig,
    rng: ChaCha8Rng,
    truth: TruthState,
    gyro_bias: f64,
    tick_fraction: [f64; 4],
    ticks: [u16; 4],
    frame_id: u32,
}

impl LaneSimulator {
    pub fn new(seed: u64, config: SynthConfig, replay: ReplayConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let bias = gaussian(&mut rng, config.gyro_bias_max / 2.0)
            .clamp(-config.gyro_bias_max, config.gyro_bias_max);
        let truth = TruthState {
            v: config.target_speed,
            ye: config.initial_offset,
            ..TruthState::default()
        };
        debug!(seed, gyro_bias = bias, "synthetic drive");

        Self {
            config,
            replay,
            rng,
            truth,
            gyro_bias: bias,
            tick_fraction: [0.0; 4],
            ticks: [0; 4],
            frame_id: 0,
        }
    }

    pub fn truth(&self) -> &TruthState {
        &self.truth
    }

    pub fn gyro_bias(&self) -> f64 {
        self.gyro_bias
    }

    fn lane_curvature(&self, distance: f64) -> f64 {
        let c = &self.config;
        c.curvature_amplitude * (TAU * distance / c.curvature_wavelength).sin()
    }

    /// Lane keeper and cruise control, as raw actuator commands.
    fn commands(&self) -> (i8, i8) {
        let c = &self.config;
        let ekf = &self.replay.ekf;
        let t = &self.truth;

        let cruise = c.target_speed * ekf.drag / ekf.max_accel;
        let throttle = (cruise + 0.5 * (c.target_speed - t.v)).clamp(-1.0, 1.0);
        let delta = t.kappa - c.heading_gain * t.psi_e - c.offset_gain * t.ye;
        let steering = (delta / ekf.max_delta).clamp(-1.0, 1.0);

        ((throttle * 127.0).round() as i8, (steering * 127.0).round() as i8)
    }

    /// Camera view of the lane for the current truth.
    fn render(&mut self) -> GrayImage {
        let layout = self.replay.layout;
        let [a, b, c] = self.truth.centerline();
        let half_width = self.config.stripe_width / 2.0;
        let noise = self.config.pixel_noise_std;

        let mut image = self.replay.birdseye.camera.render_ground(
            layout.image_width,
            layout.image_height,
            20,
            |x, y| {
                let lane_x = (a * y + b) * y + c;
                if (x - lane_x).abs() < half_width {
                    230
                } else {
                    60
                }
            },
        );

        for p in image.pixels_mut() {
            p[0] = (p[0] as f64 + gaussian(&mut self.rng, noise)).clamp(0.0, 255.0) as u8;
        }
        image
    }

    /// Advances the truth by one frame period with the estimator's motion model.
    fn step(&mut self, throttle: f64, steering: f64) {
        let dt = 1.0 / self.config.frame_rate;
        let ekf = &self.replay.ekf;
        let t = self.truth;
        let (sin_psi, cos_psi) = t.psi_e.sin_cos();
        let alpha = 1.0 - (-dt / ekf.steer_tau).exp();

        self.truth.v = t.v + dt * (ekf.max_accel * throttle - ekf.drag * t.v);
        self.truth.delta = t.delta + alpha * (ekf.max_delta * steering - t.delta);
        self.truth.ye = t.ye + dt * t.v * sin_psi;
        let lane_turn = t.v * t.kappa * cos_psi / (1.0 - t.kappa * t.ye);
        self.truth.psi_e = t.psi_e + dt * (t.v * t.delta - lane_turn);
        self.truth.distance = t.distance + dt * t.v;
        self.truth.kappa = self.lane_curvature(self.truth.distance);

        let mpt = self.replay.ekf.metres_per_tick;
        for wheel in 0..4 {
            let slip = 1.0 + gaussian(&mut self.rng, self.config.wheel_slip_std);
            self.tick_fraction[wheel] += (dt * t.v * slip / mpt).max(0.0);
            let whole = self.tick_fraction[wheel].floor();
            self.tick_fraction[wheel] -= whole;
            self.ticks[wheel] = self.ticks[wheel].wrapping_add(whole as u16);
        }
    }

    /// Produces the next record and advances the simulation.
    pub fn next_record(&mut self) -> TelemetryRecord {
        let (throttle, steering) = self.commands();
        let t = self.truth;
        let c = &self.config;
        let ekf = &self.replay.ekf;
        let rng = &mut self.rng;

        let timestamp = SYNTH_EPOCH + self.frame_id as f64 / c.frame_rate;
        let time_sec = timestamp.floor();
        let yaw_rate = t.v * t.delta + self.gyro_bias + gaussian(rng, c.gyro_noise_std);
        let servo = ekf.servo_center + ekf.servo_gain * t.delta + gaussian(rng, c.servo_noise_std);
        let lateral = t.v * t.v * t.delta;
        let accel = [
            gaussian(rng, c.accel_noise_std) as f32,
            (lateral + gaussian(rng, c.accel_noise_std)) as f32,
            (9.81 + gaussian(rng, c.accel_noise_std)) as f32,
        ];

        let record = TelemetryRecord {
            frame_id: self.frame_id,
            time_sec: time_sec as u32,
            time_usec: (((timestamp - time_sec) * 1e6).round() as u32).min(999_999),
            throttle,
            steering,
            accel,
            gyro: [0.0, 0.0, yaw_rate as f32],
            servo: servo.round().clamp(0.0, 255.0) as u8,
            wheel_ticks: self.ticks,
            wheel_aux: [0; 4],
            image: self.render(),
        };

        self.step(throttle as f64 / 127.0, steering as f64 / 127.0);
        self.frame_id += 1;
        record
    }
}

/// Writes `frames` records to `writer`; returns the writer flushed.
pub fn write_log<W: Write>(
    simulator: &mut LaneSimulator,
    mut writer: TelemetryWriter<W>,
    frames: u32,
) -> Result<W, TelemetryError> {
    for _ in 0..frames {
        writer.write_record(&simulator.next_record())?;
    }
    writer.finish()
}

/// Generates a log file from `seed`.
pub fn generate(
    path: impl AsRef<Path>,
    frames: u32,
    seed: u64,
    config: SynthConfig,
    replay: &ReplayConfig,
) -> Result<(), TelemetryError> {
    let writer = TelemetryWriter::create(path.as_ref(), replay.layout)?;
    let mut simulator = LaneSimulator::new(seed, config, replay.clone());
    write_log(&mut simulator, writer, frames)?;
    info!(
        "Wrote {} synthetic frames to {} (seed={})",
        frames,
        path.as_ref().display(),
        seed
    );
    Ok(())
}
