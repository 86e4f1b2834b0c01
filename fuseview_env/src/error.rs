//! Error types for the FuseView environment abstraction.

use thiserror::Error;

/// Errors that can cross a capability interface.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Measurement contains NaN or infinity
    #[error("Non-finite measurement for {0} update")]
    NonFiniteMeasurement(&'static str),

    /// Innovation covariance could not be factored
    #[error("Innovation covariance is not positive definite ({0} update)")]
    SingularInnovation(&'static str),

    /// Vector/matrix sizes disagree with the estimator layout
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A frame sink failed to accept or flush a frame
    #[error("Sink error: {0}")]
    Sink(String),

    /// Operator input could not be read
    #[error("Input error: {0}")]
    Input(String),
}

impl EnvError {
    /// Creates a sink error.
    pub fn sink(msg: impl std::fmt::Display) -> Self {
        Self::Sink(msg.to_string())
    }

    /// Creates an input error.
    pub fn input(msg: impl std::fmt::Display) -> Self {
        Self::Input(msg.to_string())
    }

    /// Returns true if the estimate should be kept and the session continued.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NonFiniteMeasurement(_)
                | Self::SingularInnovation(_)
                | Self::DimensionMismatch { .. }
        )
    }
}
