//! Drain completion detection
//!
//! Encode capabilities may resolve `flush` before every chunk has been
//! delivered, so the end of a job is decided by watching chunk arrivals
//! instead. A track completes through one of three paths:
//!
//! * idle: coverage is at least `idle_coverage` (or unknown) and the track
//!   has been quiet for the idle window, which is longer while coverage is
//!   still short of 100%;
//! * stall: no chunk arrived on any track for `stall_timeout_ms`, whatever
//!   the coverage;
//! * startup timeout: the track never produced a chunk within
//!   `startup_timeout_ms` of draining.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::model::TrackKind;
use crate::engine::PipelineTuning;

/// How a track was declared complete
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "path")]
pub enum CompletionReason {
    /// Quiet for the idle window with sufficient coverage
    Idle { coverage: Option<f64> },
    /// Forced by the stall safety net
    Stalled { coverage: Option<f64>, below_floor: bool },
    /// No chunk ever arrived
    StartupTimeout,
}

impl CompletionReason {
    /// Whether the track completed short of its expected output
    pub fn is_shortfall(&self) -> bool {
        match self {
            CompletionReason::Idle { coverage } => coverage.map_or(false, |c| c < 1.0),
            CompletionReason::Stalled { .. } | CompletionReason::StartupTimeout => true,
        }
    }
}

/// Completion bookkeeping for one track
#[derive(Debug, Clone, Serialize)]
pub struct TrackCompletion {
    pub kind: TrackKind,
    /// Chunks the track should produce, when known
    pub expected: Option<u64>,
    pub muxed: u64,
    #[serde(skip)]
    last_chunk_at: Option<Instant>,
    pub reason: Option<CompletionReason>,
}

impl TrackCompletion {
    /// Muxed share of the expected chunk count
    pub fn coverage(&self) -> Option<f64> {
        self.expected
            .filter(|e| *e > 0)
            .map(|e| self.muxed as f64 / e as f64)
    }

    pub fn is_complete(&self) -> bool {
        self.reason.is_some()
    }
}

/// Decides when every track has delivered its output
pub struct CompletionDetector {
    idle_coverage: f64,
    coverage_floor: f64,
    idle_window: Duration,
    near_complete_window: Duration,
    stall_timeout: Duration,
    startup_timeout: Duration,
    tracks: Vec<TrackCompletion>,
    last_any_chunk: Option<Instant>,
    drain_started: Option<Instant>,
}

impl CompletionDetector {
    pub fn new(tuning: &PipelineTuning) -> Self {
        Self {
            idle_coverage: tuning.idle_coverage,
            coverage_floor: tuning.coverage_floor,
            idle_window: Duration::from_millis(tuning.idle_window_ms),
            near_complete_window: Duration::from_millis(tuning.near_complete_idle_window_ms),
            stall_timeout: Duration::from_millis(tuning.stall_timeout_ms),
            startup_timeout: Duration::from_millis(tuning.startup_timeout_ms),
            tracks: Vec::new(),
            last_any_chunk: None,
            drain_started: None,
        }
    }

    /// Register a track that must complete before finalizing
    pub fn track(&mut self, kind: TrackKind, expected: Option<u64>) {
        self.tracks.push(TrackCompletion {
            kind,
            expected,
            muxed: 0,
            last_chunk_at: None,
            reason: None,
        });
    }

    /// Lower the expected count after a unit of the track was dropped
    pub fn expect_fewer(&mut self, kind: TrackKind) {
        if let Some(track) = self.find_mut(kind) {
            track.expected = track.expected.map(|e| e.saturating_sub(1));
        }
    }

    /// Record a muxed chunk
    pub fn observe_chunk(&mut self, kind: TrackKind, at: Instant) {
        self.last_any_chunk = Some(at);
        if let Some(track) = self.find_mut(kind) {
            track.muxed += 1;
            track.last_chunk_at = Some(at);
        }
    }

    /// Start the clocks for the startup timeout
    pub fn begin_drain(&mut self, at: Instant) {
        self.drain_started.get_or_insert(at);
    }

    pub fn tracks(&self) -> &[TrackCompletion] {
        &self.tracks
    }

    /// Re-evaluate every track; returns true once all tracks are complete
    pub fn evaluate(&mut self, now: Instant) -> bool {
        let stalled = self
            .last_any_chunk
            .map_or(false, |last| now.saturating_duration_since(last) >= self.stall_timeout);
        let startup_expired = self
            .drain_started
            .map_or(false, |start| now.saturating_duration_since(start) >= self.startup_timeout);

        for i in 0..self.tracks.len() {
            if self.tracks[i].is_complete() {
                continue;
            }
            let reason = self.verdict(&self.tracks[i], now, stalled, startup_expired);
            self.tracks[i].reason = reason;
        }

        self.tracks.iter().all(TrackCompletion::is_complete)
    }

    fn verdict(
        &self,
        track: &TrackCompletion,
        now: Instant,
        stalled: bool,
        startup_expired: bool,
    ) -> Option<CompletionReason> {
        let Some(last) = track.last_chunk_at else {
            return startup_expired.then_some(CompletionReason::StartupTimeout);
        };

        let coverage = track.coverage();
        let quiet = now.saturating_duration_since(last);
        let idle_done = match coverage {
            Some(c) if c >= 1.0 => quiet >= self.idle_window,
            Some(c) if c >= self.idle_coverage => quiet >= self.near_complete_window,
            Some(_) => false,
            None => quiet >= self.idle_window,
        };

        if idle_done {
            Some(CompletionReason::Idle { coverage })
        } else if stalled {
            Some(CompletionReason::Stalled {
                coverage,
                below_floor: coverage.map_or(false, |c| c < self.coverage_floor),
            })
        } else {
            None
        }
    }

    fn find_mut(&mut self, kind: TrackKind) -> Option<&mut TrackCompletion> {
        self.tracks.iter_mut().find(|t| t.kind == kind)
    }
}
