//! Timestamp normalization and sample reordering

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::domain::model::{EncodedSample, TimestampUnit};

/// Outcome of normalizing one chunk timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalized {
    /// Timestamp and duration in microseconds relative to the track base
    Accepted { timestamp_us: i64, duration_us: i64 },
    /// Timestamp would go backwards relative to the last accepted chunk
    OutOfOrder { timestamp_us: i64, last_us: i64 },
}

/// Per-track clock that rebases encoder output onto zero.
///
/// The first timestamp seen becomes the base; later timestamps are shifted
/// by it and clamped at zero. Accepted timestamps never decrease.
#[derive(Debug, Default)]
pub struct TrackClock {
    base_us: Option<i64>,
    last_us: Option<i64>,
}

impl TrackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_us(&self) -> Option<i64> {
        self.base_us
    }

    /// Rebase a chunk timestamp and check it against the last accepted one
    pub fn normalize(&mut self, timestamp_us: i64, duration_us: i64) -> Normalized {
        let base = *self.base_us.get_or_insert(timestamp_us);
        let relative = timestamp_us.saturating_sub(base).max(0);

        if let Some(last) = self.last_us {
            if relative < last {
                return Normalized::OutOfOrder {
                    timestamp_us: relative,
                    last_us: last,
                };
            }
        }

        self.last_us = Some(relative);
        Normalized::Accepted {
            timestamp_us: relative,
            duration_us: duration_us.max(0),
        }
    }
}

/// Convert a normalized microsecond pair into the sink's unit
pub fn to_sink_unit(unit: TimestampUnit, timestamp_us: i64, duration_us: i64) -> (i64, i64) {
    (unit.from_micros(timestamp_us), unit.from_micros(duration_us))
}

struct Pending {
    key: i64,
    seq: u64,
    sample: EncodedSample,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.seq.cmp(&other.seq))
    }
}

/// Bounded window that releases samples in ascending ordering key.
///
/// Samples arriving later than the window can absorb are released as-is and
/// counted in [`ReorderBuffer::late_samples`].
pub struct ReorderBuffer {
    window: usize,
    heap: BinaryHeap<Reverse<Pending>>,
    seq: u64,
    last_released: Option<i64>,
    late: u64,
}

impl ReorderBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            heap: BinaryHeap::with_capacity(window + 1),
            seq: 0,
            last_released: None,
            late: 0,
        }
    }

    /// Add a sample, returning the one that falls out of the window if any
    pub fn push(&mut self, sample: EncodedSample) -> Option<EncodedSample> {
        self.seq += 1;
        self.heap.push(Reverse(Pending {
            key: sample.ordering_key(),
            seq: self.seq,
            sample,
        }));
        if self.heap.len() > self.window {
            self.pop()
        } else {
            None
        }
    }

    /// Release the oldest buffered sample
    pub fn pop(&mut self) -> Option<EncodedSample> {
        let Reverse(pending) = self.heap.pop()?;
        if let Some(last) = self.last_released {
            if pending.key < last {
                self.late += 1;
            }
        }
        self.last_released = Some(self.last_released.map_or(pending.key, |l| l.max(pending.key)));
        Some(pending.sample)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Samples released behind an already released key
    pub fn late_samples(&self) -> u64 {
        self.late
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ChunkType, TrackKind};

    fn sample(ts: i64) -> EncodedSample {
        EncodedSample {
            kind: TrackKind::Video,
            chunk_type: ChunkType::Delta,
            timestamp_us: ts,
            decode_timestamp_us: None,
            duration_us: 1_000,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_clock_rebases_on_first_timestamp() {
        let mut clock = TrackClock::new();
        assert_eq!(
            clock.normalize(5_000_000, 33_333),
            Normalized::Accepted { timestamp_us: 0, duration_us: 33_333 }
        );
        assert_eq!(
            clock.normalize(5_033_333, 33_333),
            Normalized::Accepted { timestamp_us: 33_333, duration_us: 33_333 }
        );
        assert_eq!(clock.base_us(), Some(5_000_000));
    }

    #[test]
    fn test_clock_clamps_below_base_and_rejects_regressions() {
        let mut clock = TrackClock::new();
        clock.normalize(1_000, 10);
        // Earlier than the base clamps to zero, which equals the last value
        assert_eq!(
            clock.normalize(500, -5),
            Normalized::Accepted { timestamp_us: 0, duration_us: 0 }
        );
        clock.normalize(3_000, 10);
        assert_eq!(
            clock.normalize(2_000, 10),
            Normalized::OutOfOrder { timestamp_us: 1_000, last_us: 2_000 }
        );
    }

    #[test]
    fn test_sink_unit_conversion() {
        assert_eq!(to_sink_unit(TimestampUnit::Milliseconds, 1_533_333, 33_333), (1_533, 33));
        assert_eq!(to_sink_unit(TimestampUnit::Microseconds, 1_533_333, 33_333), (1_533_333, 33_333));
        assert_eq!(to_sink_unit(TimestampUnit::Timescale(90_000), 1_000_000, 40_000), (90_000, 3_600));
    }

    #[test]
    fn test_reorder_buffer_restores_order_within_window() {
        let mut buffer = ReorderBuffer::new(3);
        let mut released = Vec::new();
        for ts in [0, 2, 1, 4, 3, 6, 5, 7] {
            if let Some(s) = buffer.push(sample(ts)) {
                released.push(s.timestamp_us);
            }
        }
        while let Some(s) = buffer.pop() {
            released.push(s.timestamp_us);
        }
        assert_eq!(released, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(buffer.late_samples(), 0);
    }

    #[test]
    fn test_reorder_buffer_counts_late_samples() {
        let mut buffer = ReorderBuffer::new(1);
        let mut released = Vec::new();
        for ts in [10, 20, 30, 5] {
            if let Some(s) = buffer.push(sample(ts)) {
                released.push(s.timestamp_us);
            }
        }
        while let Some(s) = buffer.pop() {
            released.push(s.timestamp_us);
        }
        assert_eq!(released, vec![10, 20, 5, 30]);
        assert_eq!(buffer.late_samples(), 1);
    }

    #[test]
    fn test_zero_window_passes_through() {
        let mut buffer = ReorderBuffer::new(0);
        assert_eq!(buffer.push(sample(3)).map(|s| s.timestamp_us), Some(3));
        assert!(buffer.is_empty());
    }
}
