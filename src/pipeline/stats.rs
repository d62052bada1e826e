//! Pipeline counters
//!
//! Workers bump [`PipelineStats`] with relaxed atomics; readers take a
//! [`StatsSnapshot`] for logging or reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_received: AtomicU64,
    frames_decoded: AtomicU64,
    frames_errored: AtomicU64,
    frames_dropped: AtomicU64,
    points_emitted: AtomicU64,
    batches_delivered: AtomicU64,
    dispatch_errors: AtomicU64,
    decode_time_us: AtomicU64,
    dispatch_time_us: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, points: usize, elapsed: Duration) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
        self.points_emitted.fetch_add(points as u64, Ordering::Relaxed);
        self.decode_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_frame_error(&self) {
        self.frames_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self, batches: usize, elapsed: Duration) {
        self.batches_delivered
            .fetch_add(batches as u64, Ordering::Relaxed);
        self.dispatch_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_errored: self.frames_errored.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            points_emitted: self.points_emitted.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            decode_time_us: self.decode_time_us.load(Ordering::Relaxed),
            dispatch_time_us: self.dispatch_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub frames_errored: u64,
    /// Frames dropped at a full queue under the `drop` policy
    pub frames_dropped: u64,
    pub points_emitted: u64,
    pub batches_delivered: u64,
    pub dispatch_errors: u64,
    /// Cumulative decode time in microseconds
    pub decode_time_us: u64,
    /// Cumulative dispatch time in microseconds
    pub dispatch_time_us: u64,
}

impl StatsSnapshot {
    /// Mean decode latency per decoded frame in microseconds
    pub fn avg_decode_us(&self) -> f64 {
        if self.frames_decoded == 0 {
            0.0
        } else {
            self.decode_time_us as f64 / self.frames_decoded as f64
        }
    }

    /// Decoded frames as a percentage of received frames
    pub fn success_rate(&self) -> f64 {
        if self.frames_received == 0 {
            100.0
        } else {
            (self.frames_decoded as f64 / self.frames_received as f64) * 100.0
        }
    }
}
