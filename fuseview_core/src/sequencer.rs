//! The fusion cycle: one predict followed by the measurement updates, in a
//! fixed order, for every decoded record.
//!
//! Update order is centerline, then yaw rate, then wheel speed. Reordering
//! changes the numerical result, so it is encoded here once and nowhere else.

use crate::telemetry::TelemetryRecord;
use fuseview_env::{Detection, DetectorPort, EnvError, Estimate, EstimatorPort};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Nominal telemetry period (30 Hz).
pub const NOMINAL_DT: f64 = 1.0 / 30.0;

/// Configuration for the FusionSequencer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// `dt` used when there is no previous timestamp (seconds)
    pub nominal_dt: f64,

    /// Number of wheel encoders averaged into the wheel-speed measurement
    pub encoder_count: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            nominal_dt: NOMINAL_DT,
            encoder_count: 4,
        }
    }
}

/// The running estimate plus the "previous frame" context it was built on.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionState {
    pub estimate: Estimate,

    /// Wheel counters of the last committed frame
    pub prev_wheel_ticks: Option<[u16; 4]>,

    /// Timestamp of the last committed frame
    pub prev_timestamp: Option<f64>,
}

impl FusionState {
    /// Session start: prior estimate, no previous frame.
    pub fn new(estimate: Estimate) -> Self {
        Self {
            estimate,
            prev_wheel_ticks: None,
            prev_timestamp: None,
        }
    }

    /// Makes `record` the previous frame for the next cycle.
    pub fn commit(&mut self, record: &TelemetryRecord) {
        self.prev_wheel_ticks = Some(record.wheel_ticks);
        self.prev_timestamp = Some(record.timestamp());
    }
}

/// Measurement modalities, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Centerline,
    YawRate,
    WheelSpeed,
}

impl UpdateKind {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateKind::Centerline => "centerline",
            UpdateKind::YawRate => "yaw_rate",
            UpdateKind::WheelSpeed => "wheel_speed",
        }
    }
}

/// What happened to one modality during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Applied,
    /// No measurement this frame
    Skipped,
    /// Estimator refused the measurement; estimate kept
    Rejected,
}

/// Everything produced by one fusion cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Time step used for the prediction (seconds)
    pub dt: f64,

    pub detection: Detection,

    /// Estimate after the predict step
    pub predicted: Estimate,

    /// Estimate after all updates
    pub posterior: Estimate,

    /// False if the estimator rejected the prediction
    pub predict_applied: bool,

    /// Outcome per modality, in application order
    pub updates: Vec<(UpdateKind, UpdateStatus)>,
}

impl CycleReport {
    pub fn status(&self, kind: UpdateKind) -> Option<UpdateStatus> {
        self.updates.iter().find(|(k, _)| *k == kind).map(|(_, s)| *s)
    }

    /// Number of rejected steps (prediction included).
    pub fn rejected_count(&self) -> usize {
        let updates = self
            .updates
            .iter()
            .filter(|(_, s)| *s == UpdateStatus::Rejected)
            .count();
        updates + usize::from(!self.predict_applied)
    }
}

/// Runs fusion cycles against injected estimator and detector ports.
pub struct FusionSequencer<E, D> {
    estimator: E,
    detector: D,
    config: SequencerConfig,
}

impl<E: EstimatorPort, D: DetectorPort> FusionSequencer<E, D> {
    pub fn new(estimator: E, detector: D) -> Self {
        Self::with_config(estimator, detector, SequencerConfig::default())
    }

    pub fn with_config(estimator: E, detector: D, config: SequencerConfig) -> Self {
        Self {
            estimator,
            detector,
            config,
        }
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Fresh session state from the estimator's prior.
    pub fn initial_state(&self) -> FusionState {
        FusionState::new(self.estimator.initial_estimate())
    }

    /// Runs one cycle, replacing `fusion.estimate` with the posterior.
    ///
    /// The previous-frame context is left alone; committing it is the
    /// caller's decision (it only happens when the operator moves forward).
    pub fn cycle(&self, fusion: &mut FusionState, record: &TelemetryRecord) -> CycleReport {
        let dt = match fusion.prev_timestamp {
            Some(prev) => record.timestamp() - prev,
            None => self.config.nominal_dt,
        };

        let mut estimate = fusion.estimate.clone();

        // 1. Predict
        let predict_applied = match self.estimator.predict(
            &estimate,
            dt,
            record.throttle_normalized(),
            record.steering_normalized(),
        ) {
            Ok(next) => {
                estimate = next;
                true
            }
            Err(e) => {
                warn!(frame = record.frame_id, "predict rejected: {}", e);
                false
            }
        };
        let predicted = estimate.clone();
        debug!(frame = record.frame_id, dt, "x_predict {:?}", predicted.state.as_slice());

        let detection = self.detector.detect(&record.image);
        let mut updates = Vec::with_capacity(3);

        // 2. Centerline (absent measurement is silent)
        let status = match &detection.centerline {
            Some(measurement) => apply(
                UpdateKind::Centerline,
                record.frame_id,
                &mut estimate,
                |est| self.estimator.update_centerline(est, measurement),
            ),
            None => UpdateStatus::Skipped,
        };
        updates.push((UpdateKind::Centerline, status));

        // 3. Yaw rate, every frame
        let yaw_rate = record.yaw_rate();
        let status = apply(UpdateKind::YawRate, record.frame_id, &mut estimate, |est| {
            self.estimator.update_yaw_rate(est, yaw_rate)
        });
        updates.push((UpdateKind::YawRate, status));

        // 4. Wheel speed, only with a previous reading and actual motion
        let status = match fusion.prev_wheel_ticks {
            Some(prev) => {
                let delta = record.wheel_tick_delta(&prev);
                if delta != 0 {
                    let mean_ticks = delta as f64 / self.config.encoder_count as f64;
                    let servo = record.servo as f64;
                    apply(UpdateKind::WheelSpeed, record.frame_id, &mut estimate, |est| {
                        self.estimator.update_wheel_speed(est, mean_ticks / dt, servo)
                    })
                } else {
                    UpdateStatus::Skipped
                }
            }
            None => UpdateStatus::Skipped,
        };
        updates.push((UpdateKind::WheelSpeed, status));

        fusion.estimate = estimate.clone();

        CycleReport {
            dt,
            detection,
            predicted,
            posterior: estimate,
            predict_applied,
            updates,
        }
    }
}

fn apply(
    kind: UpdateKind,
    frame_id: u32,
    estimate: &mut Estimate,
    update: impl FnOnce(&Estimate) -> Result<Estimate, EnvError>,
) -> UpdateStatus {
    match update(estimate) {
        Ok(next) => {
            *estimate = next;
            debug!(frame = frame_id, "x_{} {:?}", kind.name(), estimate.state.as_slice());
            UpdateStatus::Applied
        }
        Err(e) => {
            warn!(frame = frame_id, "{} update rejected, keeping estimate: {}", kind.name(), e);
            UpdateStatus::Rejected
        }
    }
}
