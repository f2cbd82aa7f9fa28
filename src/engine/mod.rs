//! Core transcoding pipeline module

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TranscodeError, TranscodeResult};

pub mod completion;
pub mod controller;
pub mod counters;
pub mod progress;
pub mod state;
pub mod timestamps;

pub use controller::{PipelineController, PipelineIo, TranscodeReport};
pub use state::PipelineState;

/// Tunable thresholds and intervals of the pipeline controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTuning {
    /// Completion poll interval while draining
    pub poll_interval_ms: u64,
    /// Coverage below which a stalled track is reported as a severe shortfall
    pub coverage_floor: f64,
    /// Coverage required before the idle window may complete a track
    pub idle_coverage: f64,
    /// Quiet period that completes a fully covered track
    pub idle_window_ms: u64,
    /// Quiet period that completes a track past `idle_coverage` but short of 100%
    pub near_complete_idle_window_ms: u64,
    /// Quiet period after which all started tracks are forced complete
    pub stall_timeout_ms: u64,
    /// How long to wait for a track's first chunk once draining has begun
    pub startup_timeout_ms: u64,
    /// Decoder queue depth at which demuxing pauses
    pub max_decode_queue: usize,
    /// Sleep between backpressure checks
    pub backpressure_poll_ms: u64,
    /// Samples held back per track to restore submission order
    pub reorder_window: usize,
    /// Share of overall progress attributed to format detection
    pub demux_progress_weight: f64,
    /// Minimum spacing between progress reports
    pub progress_interval_ms: u64,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            coverage_floor: 0.90,
            idle_coverage: 0.99,
            idle_window_ms: 500,
            near_complete_idle_window_ms: 3_000,
            stall_timeout_ms: 30_000,
            startup_timeout_ms: 120_000,
            max_decode_queue: 30,
            backpressure_poll_ms: 5,
            reorder_window: 16,
            demux_progress_weight: 10.0,
            progress_interval_ms: 100,
        }
    }
}

impl PipelineTuning {
    /// Check that thresholds and intervals are usable
    pub fn validate(&self) -> TranscodeResult<()> {
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(self.coverage_floor) || !in_unit(self.idle_coverage) {
            return Err(TranscodeError::Config {
                message: "Coverage thresholds must be within (0, 1]".to_string(),
            });
        }
        if self.coverage_floor > self.idle_coverage {
            return Err(TranscodeError::Config {
                message: format!(
                    "coverage_floor ({}) must not exceed idle_coverage ({})",
                    self.coverage_floor, self.idle_coverage
                ),
            });
        }
        if self.poll_interval_ms == 0 || self.backpressure_poll_ms == 0 || self.stall_timeout_ms == 0 {
            return Err(TranscodeError::Config {
                message: "Poll intervals and the stall timeout must be non-zero".to_string(),
            });
        }
        if self.max_decode_queue == 0 {
            return Err(TranscodeError::Config {
                message: "max_decode_queue must be at least 1".to_string(),
            });
        }
        if !(0.0..100.0).contains(&self.demux_progress_weight) {
            return Err(TranscodeError::Config {
                message: "demux_progress_weight must be within [0, 100)".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tuning_is_valid() {
        assert!(PipelineTuning::default().validate().is_ok());
    }

    #[test]
    fn test_tuning_rejects_inverted_thresholds() {
        let tuning = PipelineTuning {
            coverage_floor: 0.995,
            idle_coverage: 0.99,
            ..PipelineTuning::default()
        };
        assert!(matches!(tuning.validate(), Err(TranscodeError::Config { .. })));
    }

    #[test]
    fn test_tuning_rejects_zero_intervals() {
        let tuning = PipelineTuning {
            poll_interval_ms: 0,
            ..PipelineTuning::default()
        };
        assert!(tuning.validate().is_err());
    }

    #[test]
    fn test_tuning_partial_toml() {
        let tuning: PipelineTuning = toml::from_str("stall_timeout_ms = 500\nreorder_window = 4").unwrap();
        assert_eq!(tuning.stall_timeout_ms, 500);
        assert_eq!(tuning.reorder_window, 4);
        assert_eq!(tuning.idle_window_ms, 500);
    }
}
