//! Shared pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::domain::model::TrackKind;

/// Atomic counters read by progress reporting and completion detection
#[derive(Debug, Default)]
pub struct PipelineCounters {
    samples_demuxed: [AtomicU64; 2],
    frames_decoded: [AtomicU64; 2],
    chunks_encoded: [AtomicU64; 2],
    chunks_muxed: [AtomicU64; 2],
    pending_writes: [AtomicU64; 2],
    dropped: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub samples_demuxed: [u64; 2],
    pub frames_decoded: [u64; 2],
    pub chunks_encoded: [u64; 2],
    pub chunks_muxed: [u64; 2],
    pub pending_writes: [u64; 2],
    pub dropped: u64,
}

impl PipelineCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sample_demuxed(&self, kind: TrackKind) {
        self.samples_demuxed[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_decoded(&self, kind: TrackKind) {
        self.frames_decoded[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_encoded(&self, kind: TrackKind) {
        self.chunks_encoded[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_muxed(&self, kind: TrackKind) {
        self.chunks_muxed[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn unit_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_decoded(&self, kind: TrackKind) -> u64 {
        self.frames_decoded[kind.index()].load(Ordering::Relaxed)
    }

    pub fn chunks_encoded(&self, kind: TrackKind) -> u64 {
        self.chunks_encoded[kind.index()].load(Ordering::Relaxed)
    }

    pub fn chunks_muxed(&self, kind: TrackKind) -> u64 {
        self.chunks_muxed[kind.index()].load(Ordering::Relaxed)
    }

    pub fn pending_writes(&self, kind: TrackKind) -> u64 {
        self.pending_writes[kind.index()].load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Video and audio chunks muxed so far
    pub fn muxed_pair(&self) -> (u64, u64) {
        (self.chunks_muxed(TrackKind::Video), self.chunks_muxed(TrackKind::Audio))
    }

    /// Mark a mux write in flight until the returned guard is dropped
    pub fn begin_write(self: &Arc<Self>, kind: TrackKind) -> PendingWrite {
        self.pending_writes[kind.index()].fetch_add(1, Ordering::AcqRel);
        PendingWrite {
            counters: Arc::clone(self),
            kind,
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |a: &[AtomicU64; 2]| [a[0].load(Ordering::Relaxed), a[1].load(Ordering::Relaxed)];
        CounterSnapshot {
            samples_demuxed: load(&self.samples_demuxed),
            frames_decoded: load(&self.frames_decoded),
            chunks_encoded: load(&self.chunks_encoded),
            chunks_muxed: load(&self.chunks_muxed),
            pending_writes: load(&self.pending_writes),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the pending write counter on every exit path
pub struct PendingWrite {
    counters: Arc<PipelineCounters>,
    kind: TrackKind,
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.counters.pending_writes[self.kind.index()].fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_write_guard_releases_on_drop() {
        let counters = PipelineCounters::new();
        {
            let _a = counters.begin_write(TrackKind::Video);
            let _b = counters.begin_write(TrackKind::Video);
            assert_eq!(counters.pending_writes(TrackKind::Video), 2);
            assert_eq!(counters.pending_writes(TrackKind::Audio), 0);
        }
        assert_eq!(counters.pending_writes(TrackKind::Video), 0);
    }

    #[test]
    fn test_pending_write_guard_releases_on_error_path() {
        let counters = PipelineCounters::new();
        let result: Result<(), &str> = (|| {
            let _guard = counters.begin_write(TrackKind::Audio);
            Err("mux rejected chunk")
        })();
        assert!(result.is_err());
        assert_eq!(counters.pending_writes(TrackKind::Audio), 0);
    }

    #[test]
    fn test_snapshot_tracks_per_kind() {
        let counters = PipelineCounters::new();
        counters.chunk_muxed(TrackKind::Video);
        counters.chunk_muxed(TrackKind::Video);
        counters.chunk_muxed(TrackKind::Audio);
        counters.unit_dropped();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.chunks_muxed, [2, 1]);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(counters.muxed_pair(), (2, 1));
    }
}
