//! Per-manager lock-free byte accumulator with a ring-buffered history of
//! 1 Hz samples, used to derive rolling-window throughput averages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Ring buffer length: 300 one-second samples (5 minutes of history).
pub const RING_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Monotonically growing total plus a ring of recent 1 Hz byte-count
/// samples. `record_tick` is meant to be called once per second by the
/// Client Manager's sampler task with the delta bytes observed in that
/// second; `total()` can be read from anywhere, lock-free.
pub struct ThroughputTracker {
    total: AtomicU64,
    ring: Mutex<Vec<Sample>>,
    start: Instant,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            ring: Mutex::new(Vec::with_capacity(RING_CAPACITY)),
            start: Instant::now(),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Record one second's worth of delta bytes.
    pub fn record_tick(&self, delta_bytes: u64) {
        self.total.fetch_add(delta_bytes, Ordering::Relaxed);
        let mut ring = self.ring.lock();
        ring.push(Sample {
            at: Instant::now(),
            bytes: delta_bytes,
        });
        if ring.len() > RING_CAPACITY {
            let overflow = ring.len() - RING_CAPACITY;
            ring.drain(0..overflow);
        }
    }

    /// Average bytes/sec over the trailing `window`, scanning only samples
    /// within the window. Returns 0 if there are no samples in range (e.g.
    /// after an idle period longer than the window).
    pub fn rolling_average(&self, window: Duration) -> f64 {
        let ring = self.ring.lock();
        if ring.is_empty() {
            return 0.0;
        }
        let now = Instant::now();
        let in_window: Vec<&Sample> = ring
            .iter()
            .filter(|s| now.duration_since(s.at) <= window)
            .collect();
        if in_window.is_empty() {
            return 0.0;
        }
        let sum: u64 = in_window.iter().map(|s| s.bytes).sum();
        let span_secs = window.as_secs_f64().min(
            now.duration_since(in_window.first().map(|s| s.at).unwrap_or(now))
                .as_secs_f64()
                .max(1.0),
        );
        sum as f64 / span_secs
    }

    /// Overall average since this tracker was created.
    pub fn overall_average(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64().max(1.0);
        self.total() as f64 / elapsed
    }
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}
