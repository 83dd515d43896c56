//! Accumulates whole-run statistics (restarts, exit codes, uptimes) as
//! worker supervisors report lifecycle events, and renders the final
//! `RunSummary` printed on every exit path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

const UPTIME_HISTOGRAM_MAX_MS: u64 = 6 * 60 * 60 * 1000; // 6 hours

/// Shared, lock-light accumulator fed by every client's supervisor as it
/// runs. Cheap to clone an `Arc` of; the only lock taken is the uptime
/// histogram's, and only for the duration of one `record`/`value_at_quantile`
/// call.
pub struct RunSummaryCollector {
    started_at: Instant,
    total_starts: AtomicU64,
    total_restarts: AtomicU64,
    total_fatal: AtomicU64,
    peak_active: AtomicU64,
    exit_codes: Mutex<HashMap<i32, u64>>,
    uptimes_ms: Mutex<Histogram<u64>>,
}

impl RunSummaryCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_starts: AtomicU64::new(0),
            total_restarts: AtomicU64::new(0),
            total_fatal: AtomicU64::new(0),
            peak_active: AtomicU64::new(0),
            exit_codes: Mutex::new(HashMap::new()),
            uptimes_ms: Mutex::new(
                Histogram::new_with_bounds(1, UPTIME_HISTOGRAM_MAX_MS, 3).expect("valid histogram bounds"),
            ),
        }
    }

    pub fn record_start(&self) {
        self.total_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exit(&self, exit_code: i32, uptime: Duration) {
        *self.exit_codes.lock().entry(exit_code).or_insert(0) += 1;
        let ms = uptime.as_millis().clamp(1, UPTIME_HISTOGRAM_MAX_MS as u128) as u64;
        let _ = self.uptimes_ms.lock().record(ms);
    }

    pub fn record_restart(&self) {
        self.total_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self) {
        self.total_fatal.fetch_add(1, Ordering::Relaxed);
    }

    /// Report the current active count; only the maximum observed ever
    /// survives in `peak_active`.
    pub fn observe_active(&self, active: usize) {
        self.peak_active.fetch_max(active as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunSummary {
        let hist = self.uptimes_ms.lock();
        RunSummary {
            run_duration: self.started_at.elapsed(),
            total_starts: self.total_starts.load(Ordering::Relaxed),
            total_restarts: self.total_restarts.load(Ordering::Relaxed),
            total_fatal: self.total_fatal.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            exit_codes: {
                let mut v: Vec<(i32, u64)> = self.exit_codes.lock().iter().map(|(k, v)| (*k, *v)).collect();
                v.sort_by_key(|(code, _)| *code);
                v
            },
            uptime_p50: Duration::from_millis(hist.value_at_quantile(0.5)),
            uptime_p90: Duration::from_millis(hist.value_at_quantile(0.9)),
            uptime_p99: Duration::from_millis(hist.value_at_quantile(0.99)),
            uptime_max: Duration::from_millis(hist.max()),
        }
    }
}

impl Default for RunSummaryCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable, point-in-time rollup printed at the end of every run,
/// including runs ended by a signal.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_duration: Duration,
    pub total_starts: u64,
    pub total_restarts: u64,
    pub total_fatal: u64,
    pub peak_active: u64,
    pub exit_codes: Vec<(i32, u64)>,
    pub uptime_p50: Duration,
    pub uptime_p90: Duration,
    pub uptime_p99: Duration,
    pub uptime_max: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run duration:     {:.1}s", self.run_duration.as_secs_f64())?;
        writeln!(f, "peak active:      {}", self.peak_active)?;
        writeln!(f, "worker starts:    {}", self.total_starts)?;
        writeln!(f, "worker restarts:  {}", self.total_restarts)?;
        writeln!(f, "fatal (gave up):  {}", self.total_fatal)?;
        writeln!(
            f,
            "uptime p50/p90/p99/max: {:.1}s / {:.1}s / {:.1}s / {:.1}s",
            self.uptime_p50.as_secs_f64(),
            self.uptime_p90.as_secs_f64(),
            self.uptime_p99.as_secs_f64(),
            self.uptime_max.as_secs_f64(),
        )?;
        if self.exit_codes.is_empty() {
            writeln!(f, "exit codes:       (none observed)")?;
        } else {
            write!(f, "exit codes:       ")?;
            let parts: Vec<String> = self.exit_codes.iter().map(|(code, n)| format!("{code}={n}")).collect();
            writeln!(f, "{}", parts.join(", "))?;
        }
        Ok(())
    }
}
