//! FuseView Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary between the fusion core and
//! everything it treats as an external collaborator:
//! - The motion/perception estimator (`EstimatorPort`)
//! - The centerline detector (`DetectorPort`)
//! - Frame sinks: video writer and interactive display (`FrameSink`)
//! - Operator keystrokes (`CommandSource`)
//!
//! The core only ever talks to these traits, so every collaborator can be
//! replaced by a test double returning fixed, deterministic outputs.
//!
//! # Example
//!
//! ```ignore
//! use fuseview_env::{EstimatorPort, DetectorPort};
//!
//! fn fuse<E: EstimatorPort, D: DetectorPort>(estimator: &E, detector: &D, frame: &GrayImage) {
//!     let prior = estimator.initial_estimate();
//!     let detection = detector.detect(frame);
//!     if let Some(m) = &detection.centerline {
//!         let _posterior = estimator.update_centerline(&prior, m);
//!     }
//! }
//! ```

mod error;
mod frame;
mod io;
mod ports;
mod types;

pub use error::EnvError;
pub use frame::{Label, Overlay, PixelRect, Primitive, RenderFrame, Rgb};
pub use image::{GrayImage, RgbImage};
pub use io::{Command, CommandSource, FrameSink, ScriptedCommands};
pub use ports::{DetectorPort, EstimatorPort};
pub use types::{
    peak_response, CenterlineMeasurement, Covariance, Detection, Estimate, EstimatorState,
    ResponseImage,
};
