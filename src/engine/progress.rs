//! Progress tracking and reporters for UI integration

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::model::{ProgressEvent, ProgressStage};
use crate::ports::ProgressReporter;

/// Computes weighted progress and throttles delivery to a reporter.
///
/// Format detection accounts for the first `demux_weight` percent of the
/// job; encoded video chunks against the source frame count cover the rest.
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    started: Instant,
    interval: Duration,
    last_report: Option<Instant>,
    demux_weight: f64,
    total_frames: Option<u64>,
}

impl ProgressTracker {
    pub fn new(reporter: Arc<dyn ProgressReporter>, demux_weight: f64, interval: Duration) -> Self {
        Self {
            reporter,
            started: Instant::now(),
            interval,
            last_report: None,
            demux_weight,
            total_frames: None,
        }
    }

    /// Set the frame count that encode progress is measured against
    pub fn set_total_frames(&mut self, total: Option<u64>) {
        self.total_frames = total.filter(|t| *t > 0);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Report how much of the source has been parsed
    pub fn demux_progress(&mut self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        let event = ProgressEvent {
            stage: ProgressStage::Demuxing,
            stage_percent: Some(percent),
            overall_percent: Some(percent / 100.0 * self.demux_weight),
            fps: None,
            elapsed_ms: self.elapsed().as_millis() as u64,
            eta_ms: None,
        };
        self.emit(event, false);
    }

    /// Report encode progress; throttled unless `force` is set
    pub fn encode_progress(&mut self, chunks_encoded: u64, frames_decoded: u64, force: bool) {
        let event = self.encode_event(chunks_encoded, frames_decoded, self.elapsed());
        self.emit(event, force);
    }

    pub fn finalizing(&mut self) {
        let event = ProgressEvent {
            stage: ProgressStage::Finalizing,
            stage_percent: None,
            overall_percent: self.total_frames.map(|_| 100.0),
            fps: None,
            elapsed_ms: self.elapsed().as_millis() as u64,
            eta_ms: Some(0),
        };
        self.emit(event, true);
    }

    pub fn done(&mut self) {
        let event = ProgressEvent {
            stage: ProgressStage::Done,
            stage_percent: Some(100.0),
            overall_percent: Some(100.0),
            fps: None,
            elapsed_ms: self.elapsed().as_millis() as u64,
            eta_ms: Some(0),
        };
        self.emit(event, true);
    }

    /// Build the encode-stage event for the given counters
    pub fn encode_event(&self, chunks_encoded: u64, frames_decoded: u64, elapsed: Duration) -> ProgressEvent {
        let secs = elapsed.as_secs_f64();
        let fps = (secs > 0.0).then(|| frames_decoded as f64 / secs);
        let ratio = self
            .total_frames
            .map(|total| (chunks_encoded as f64 / total as f64).min(1.0));

        let eta_ms = ratio.filter(|r| *r > 0.0).map(|r| {
            let remaining = secs / r - secs;
            (remaining.max(0.0) * 1000.0).round() as u64
        });

        ProgressEvent {
            stage: ProgressStage::Encoding,
            stage_percent: ratio.map(|r| r * 100.0),
            overall_percent: ratio.map(|r| self.demux_weight + r * (100.0 - self.demux_weight)),
            fps,
            elapsed_ms: elapsed.as_millis() as u64,
            eta_ms,
        }
    }

    fn emit(&mut self, event: ProgressEvent, force: bool) {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_report {
                if now.duration_since(last) < self.interval {
                    return;
                }
            }
        }
        self.last_report = Some(now);
        self.reporter.report(&event);
    }
}

/// Console reporter for CLI usage
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleReporter {
    fn report(&self, event: &ProgressEvent) {
        match event.overall_percent {
            Some(percent) => {
                let bar_length = 20;
                let filled = ((percent / 100.0) * bar_length as f64).clamp(0.0, bar_length as f64) as usize;
                let bar = "#".repeat(filled) + &"-".repeat(bar_length - filled);
                let fps = event.fps.map(|f| format!(" {:.1} fps", f)).unwrap_or_default();
                let eta = event
                    .eta_ms
                    .map(|ms| format!(" eta {:.1}s", ms as f64 / 1000.0))
                    .unwrap_or_default();
                eprintln!("[{}] {:>5.1}% {:?}{}{}", bar, percent, event.stage, fps, eta);
            }
            None if self.verbose => {
                eprintln!("{:?}: {:.1}s elapsed", event.stage, event.elapsed_ms as f64 / 1000.0);
            }
            None => {}
        }
    }
}

/// JSON reporter emitting one event per line on stdout
pub struct JsonReporter;

impl ProgressReporter for JsonReporter {
    fn report(&self, event: &ProgressEvent) {
        let line = serde_json::json!({
            "event": "progress",
            "stage": event.stage,
            "stage_percent": event.stage_percent,
            "overall_percent": event.overall_percent,
            "fps": event.fps,
            "elapsed_ms": event.elapsed_ms,
            "eta_ms": event.eta_ms,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        println!("{}", line);
    }
}
