//! Per-worker lock-free counters.
//!
//! Every field is an atomic integer (or an atomic-backed array/cell), so
//! writers (parsers) and readers (the aggregator, snapshot consumers) never
//! take a lock and a reader never observes a counter decreasing.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Number of HTTP status buckets: codes 400..=599 plus one "other" bucket.
pub const HTTP_BUCKETS: usize = 201;

fn http_bucket_index(code: u32) -> usize {
    if (400..=599).contains(&code) {
        (code - 400) as usize
    } else {
        HTTP_BUCKETS - 1
    }
}

/// A single observed progress record, published atomically by the progress
/// parser whenever a `progress=continue|end` terminator line arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressSample {
    pub speed: f64,
    pub drift: Duration,
    pub bytes_delta: u64,
}

/// Per-worker counters. Cheap to clone an `Arc` of; expensive (and
/// unnecessary) to lock.
#[derive(Debug)]
pub struct ClientStats {
    manifest_requests: AtomicU64,
    segment_requests: AtomicU64,
    init_requests: AtomicU64,
    unknown_requests: AtomicU64,
    bytes_downloaded: AtomicU64,
    reconnections: AtomicU64,
    timeouts: AtomicU64,

    event_lines_read: AtomicU64,
    event_lines_dropped: AtomicU64,
    log_lines_read: AtomicU64,
    log_lines_dropped: AtomicU64,

    http_status: Vec<AtomicU64>,

    segment_lookup_attempts: AtomicU64,
    segment_lookup_success: AtomicU64,

    // last-observed speed (x1000 fixed point) and drift (ms), for lock-free
    // storage of floats that still need atomic read/write.
    last_speed_milli: AtomicI64,
    last_drift_ms: AtomicI64,
    last_progress_at: Mutex<Option<Instant>>,

    /// Tracks the previous segment request seen, so completion only fires
    /// on a genuinely new segment arriving (idempotent classification,
    /// non-idempotent completion).
    last_segment_key: Mutex<Option<String>>,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self {
            manifest_requests: AtomicU64::new(0),
            segment_requests: AtomicU64::new(0),
            init_requests: AtomicU64::new(0),
            unknown_requests: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            event_lines_read: AtomicU64::new(0),
            event_lines_dropped: AtomicU64::new(0),
            log_lines_read: AtomicU64::new(0),
            log_lines_dropped: AtomicU64::new(0),
            http_status: (0..HTTP_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
            segment_lookup_attempts: AtomicU64::new(0),
            segment_lookup_success: AtomicU64::new(0),
            last_speed_milli: AtomicI64::new(0),
            last_drift_ms: AtomicI64::new(0),
            last_progress_at: Mutex::new(None),
            last_segment_key: Mutex::new(None),
        }
    }
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_manifest_request(&self) {
        self.manifest_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_request(&self) {
        self.segment_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_init_request(&self) {
        self.init_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_request(&self) {
        self.unknown_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_http_status(&self, code: u32) {
        self.http_status[http_bucket_index(code)].fetch_add(1, Ordering::Relaxed);
    }

    /// Mirror the event-channel pipeline's read/dropped counters onto this
    /// client's stats so a snapshot can report pipeline health per client.
    pub fn set_event_pipeline_counts(&self, read: u64, dropped: u64) {
        self.event_lines_read.store(read, Ordering::Relaxed);
        self.event_lines_dropped.store(dropped, Ordering::Relaxed);
    }

    /// Mirror the log-channel pipeline's read/dropped counters.
    pub fn set_log_pipeline_counts(&self, read: u64, dropped: u64) {
        self.log_lines_read.store(read, Ordering::Relaxed);
        self.log_lines_dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn event_lines_read(&self) -> u64 {
        self.event_lines_read.load(Ordering::Relaxed)
    }

    pub fn event_lines_dropped(&self) -> u64 {
        self.event_lines_dropped.load(Ordering::Relaxed)
    }

    pub fn log_lines_read(&self) -> u64 {
        self.log_lines_read.load(Ordering::Relaxed)
    }

    pub fn log_lines_dropped(&self) -> u64 {
        self.log_lines_dropped.load(Ordering::Relaxed)
    }

    pub fn record_segment_lookup(&self, success: bool) {
        self.segment_lookup_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.segment_lookup_success.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_progress(&self, sample: ProgressSample) {
        self.last_speed_milli
            .store((sample.speed * 1000.0) as i64, Ordering::Relaxed);
        self.last_drift_ms
            .store(sample.drift.as_millis() as i64, Ordering::Relaxed);
        *self.last_progress_at.lock() = Some(Instant::now());
    }

    /// Returns `true` exactly once per distinct new segment key: the first
    /// time a key is seen it is recorded and `false` is returned (nothing
    /// completed yet, since there's no predecessor); every later *distinct*
    /// key returned afterward reports the previous one completed.
    pub fn observe_segment_key(&self, key: &str) -> Option<String> {
        let mut last = self.last_segment_key.lock();
        if last.as_deref() == Some(key) {
            // Duplicate emission of the same request: idempotent, no new completion.
            return None;
        }
        let previous = last.replace(key.to_string());
        previous
    }

    pub fn last_speed(&self) -> f64 {
        self.last_speed_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn last_drift(&self) -> Duration {
        Duration::from_millis(self.last_drift_ms.load(Ordering::Relaxed).max(0) as u64)
    }

    pub fn last_progress_at(&self) -> Option<Instant> {
        *self.last_progress_at.lock()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn segment_lookup_attempts(&self) -> u64 {
        self.segment_lookup_attempts.load(Ordering::Relaxed)
    }

    pub fn segment_lookup_success(&self) -> u64 {
        self.segment_lookup_success.load(Ordering::Relaxed)
    }

    pub fn manifest_requests(&self) -> u64 {
        self.manifest_requests.load(Ordering::Relaxed)
    }

    pub fn segment_requests(&self) -> u64 {
        self.segment_requests.load(Ordering::Relaxed)
    }

    pub fn init_requests(&self) -> u64 {
        self.init_requests.load(Ordering::Relaxed)
    }

    pub fn unknown_requests(&self) -> u64 {
        self.unknown_requests.load(Ordering::Relaxed)
    }

    pub fn http_status_total(&self, code: u32) -> u64 {
        self.http_status[http_bucket_index(code)].load(Ordering::Relaxed)
    }

    pub fn http_other_total(&self) -> u64 {
        self.http_status[HTTP_BUCKETS - 1].load(Ordering::Relaxed)
    }

    pub fn http_status_snapshot(&self) -> Vec<(u32, u64)> {
        (400u32..=599)
            .filter_map(|code| {
                let v = self.http_status[http_bucket_index(code)].load(Ordering::Relaxed);
                (v > 0).then_some((code, v))
            })
            .collect()
    }
}

/// Point-in-time, immutable snapshot of one client's stats. Never mutated
/// after construction.
#[derive(Debug, Clone)]
pub struct ClientSummary {
    /// Filled in by the aggregator after conversion; `0` is a valid client
    /// id, so this is not itself a "missing" sentinel.
    pub client_id: u64,
    pub manifest_requests: u64,
    pub segment_requests: u64,
    pub init_requests: u64,
    pub unknown_requests: u64,
    pub bytes_downloaded: u64,
    pub reconnections: u64,
    pub timeouts: u64,
    pub last_speed: f64,
    pub last_drift: Duration,
    pub segment_lookup_attempts: u64,
    pub segment_lookup_success: u64,
    pub http_errors: Vec<(u32, u64)>,
    pub http_other: u64,
    pub event_lines_read: u64,
    pub event_lines_dropped: u64,
    pub log_lines_read: u64,
    pub log_lines_dropped: u64,
}

impl From<&ClientStats> for ClientSummary {
    fn from(s: &ClientStats) -> Self {
        Self {
            client_id: 0,
            manifest_requests: s.manifest_requests(),
            segment_requests: s.segment_requests(),
            init_requests: s.init_requests(),
            unknown_requests: s.unknown_requests(),
            bytes_downloaded: s.bytes_downloaded(),
            reconnections: s.reconnections(),
            timeouts: s.timeouts(),
            last_speed: s.last_speed(),
            last_drift: s.last_drift(),
            segment_lookup_attempts: s.segment_lookup_attempts(),
            segment_lookup_success: s.segment_lookup_success(),
            http_errors: s.http_status_snapshot(),
            http_other: s.http_other_total(),
            event_lines_read: s.event_lines_read(),
            event_lines_dropped: s.event_lines_dropped(),
            log_lines_read: s.log_lines_read(),
            log_lines_dropped: s.log_lines_dropped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_buckets_are_distinct() {
        let stats = ClientStats::new();
        stats.record_http_status(404);
        stats.record_http_status(500);
        stats.record_http_status(599);
        stats.record_http_status(399); // below range -> other
        stats.record_http_status(700); // above range -> other

        assert_eq!(stats.http_status_total(404), 1);
        assert_eq!(stats.http_status_total(500), 1);
        assert_eq!(stats.http_status_total(599), 1);
        assert_eq!(stats.http_other_total(), 2);
    }

    #[test]
    fn counters_never_appear_to_decrease_under_concurrent_writes() {
        let stats = std::sync::Arc::new(ClientStats::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let s = stats.clone();
                scope.spawn(move || {
                    for _ in 0..1000 {
                        s.add_bytes(1);
                    }
                });
            }
        });
        assert_eq!(stats.bytes_downloaded(), 8000);
    }

    #[test]
    fn segment_completion_is_idempotent_on_duplicate_emission() {
        let stats = ClientStats::new();
        assert_eq!(stats.observe_segment_key("seg1"), None);
        assert_eq!(stats.observe_segment_key("seg1"), None); // duplicate, no completion
        assert_eq!(stats.observe_segment_key("seg2"), Some("seg1".to_string()));
        assert_eq!(stats.observe_segment_key("seg2"), None); // duplicate again
        assert_eq!(stats.observe_segment_key("seg3"), Some("seg2".to_string()));
    }

    #[test]
    fn lookup_success_never_exceeds_attempts() {
        let stats = ClientStats::new();
        stats.record_segment_lookup(true);
        stats.record_segment_lookup(false);
        stats.record_segment_lookup(true);
        assert!(stats.segment_lookup_success() <= stats.segment_lookup_attempts());
        assert_eq!(stats.segment_lookup_attempts(), 3);
        assert_eq!(stats.segment_lookup_success(), 2);
    }
}
