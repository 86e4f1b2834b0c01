//! Pre-cycle snapshots for single-step rewind.

use crate::sequencer::FusionState;
use fuseview_env::Estimate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// Rewind requested with nothing recorded
    #[error("History is empty")]
    EmptyHistory,
}

/// Everything needed to re-run a frame's fusion cycle exactly.
///
/// Taken *before* the cycle, so restoring it and re-reading the same record
/// reproduces the cycle bit for bit with a pure estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub estimate: Estimate,
    pub prev_wheel_ticks: Option<[u16; 4]>,
    pub prev_timestamp: Option<f64>,
}

impl From<&FusionState> for HistoryEntry {
    fn from(state: &FusionState) -> Self {
        Self {
            estimate: state.estimate.clone(),
            prev_wheel_ticks: state.prev_wheel_ticks,
            prev_timestamp: state.prev_timestamp,
        }
    }
}

impl From<HistoryEntry> for FusionState {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            estimate: entry.estimate,
            prev_wheel_ticks: entry.prev_wheel_ticks,
            prev_timestamp: entry.prev_timestamp,
        }
    }
}

/// LIFO of committed frames. The top is the frame just behind the one on screen.
#[derive(Debug, Default)]
pub struct HistoryStack {
    entries: Vec<HistoryEntry>,
}

impl HistoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Result<HistoryEntry, HistoryError> {
        self.entries.pop().ok_or(HistoryError::EmptyHistory)
    }

    pub fn peek(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
