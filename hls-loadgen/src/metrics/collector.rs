//! Holds the latest values for every metric the exposition endpoint
//! reports. Unlike `ClientStats` (many concurrent writers, one field each),
//! this collector has exactly one writer — the orchestrator's periodic
//! scrape-and-publish tick — and a handful of concurrent HTTP readers, so a
//! single `RwLock`-guarded struct is the right tool rather than a field per
//! atomic.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::scraper::OriginSample;
use crate::stats::AggregatedStats;
use crate::summary::RunSummary;

#[derive(Debug, Clone, Copy)]
pub struct MetricsCollectorConfig {
    /// Expose one gauge per client (keyed by client id) in addition to the
    /// aggregate series. Off by default: cardinality grows with `--clients`.
    pub per_client_gauges: bool,
}

impl Default for MetricsCollectorConfig {
    fn default() -> Self {
        Self { per_client_gauges: false }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MetricsState {
    pub active_clients: u64,
    pub target_clients: u64,
    pub ramp_started: u64,
    pub stalled_clients: u64,
    pub degraded_clients: u64,
    pub count_above_realtime: u64,
    pub count_below_realtime: u64,
    pub clients_with_high_drift: u64,

    pub total_restarts: u64,
    pub total_fatal: u64,
    pub restarts_by_exit_code: HashMap<i32, u64>,

    pub uptime_p50_ms: u64,
    pub uptime_p90_ms: u64,
    pub uptime_p99_ms: u64,
    pub uptime_max_ms: u64,

    pub http_errors: HashMap<u32, u64>,
    pub http_other: u64,

    pub total_bytes: u64,
    pub instant_bytes_per_sec: f64,
    pub throughput_w1s: f64,
    pub throughput_w30s: f64,
    pub throughput_w60s: f64,
    pub throughput_w300s: f64,

    pub per_client_bytes: HashMap<u64, u64>,

    pub origin_cpu_percent: Option<f64>,
    pub origin_memory_used_bytes: Option<f64>,
    pub origin_memory_total_bytes: Option<f64>,
    pub origin_net_in_bytes_per_sec: Option<f64>,
    pub origin_net_out_bytes_per_sec: Option<f64>,
    pub origin_nginx_requests_per_sec: Option<f64>,
    pub origin_nginx_connections: Option<f64>,
}

pub struct MetricsCollector {
    config: MetricsCollectorConfig,
    state: RwLock<MetricsState>,
}

impl MetricsCollector {
    pub fn new(config: MetricsCollectorConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MetricsState::default()),
        }
    }

    /// Fold a fresh `AggregatedStats` pull into the published state.
    /// `ramp_started` is the number of clients the ramp scheduler has
    /// released so far, reported as ramp progress against `target_count`.
    pub fn update_from_stats(&self, stats: &AggregatedStats, ramp_started: u64) {
        let mut state = self.state.write();
        state.active_clients = stats.active_count as u64;
        state.target_clients = stats.target_count as u64;
        state.ramp_started = ramp_started;
        state.stalled_clients = stats.stalled_count as u64;
        state.degraded_clients = stats.degraded_clients as u64;
        state.count_above_realtime = stats.count_above_realtime as u64;
        state.count_below_realtime = stats.count_below_realtime as u64;
        state.clients_with_high_drift = stats.clients_with_high_drift as u64;
        state.total_bytes = stats.total_bytes;
        state.instant_bytes_per_sec = stats.instant_bytes_per_sec;
        state.throughput_w1s = stats.throughput.w1s;
        state.throughput_w30s = stats.throughput.w30s;
        state.throughput_w60s = stats.throughput.w60s;
        state.throughput_w300s = stats.throughput.w300s;

        let mut http_errors = HashMap::new();
        let mut http_other = 0u64;
        let mut per_client_bytes = HashMap::new();
        for client in &stats.per_client {
            for (code, count) in &client.http_errors {
                *http_errors.entry(*code).or_insert(0) += count;
            }
            http_other += client.http_other;
            if self.config.per_client_gauges {
                per_client_bytes.insert(client.client_id, client.bytes_downloaded);
            }
        }
        state.http_errors = http_errors;
        state.http_other = http_other;
        state.per_client_bytes = per_client_bytes;
    }

    pub fn update_from_summary(&self, summary: &RunSummary) {
        let mut state = self.state.write();
        state.total_restarts = summary.total_restarts;
        state.total_fatal = summary.total_fatal;
        state.restarts_by_exit_code = summary.exit_codes.iter().copied().collect();
        state.uptime_p50_ms = summary.uptime_p50.as_millis() as u64;
        state.uptime_p90_ms = summary.uptime_p90.as_millis() as u64;
        state.uptime_p99_ms = summary.uptime_p99.as_millis() as u64;
        state.uptime_max_ms = summary.uptime_max.as_millis() as u64;
    }

    pub fn update_from_origin(&self, sample: Option<&OriginSample>) {
        let mut state = self.state.write();
        match sample {
            Some(s) => {
                state.origin_cpu_percent = Some(s.cpu_percent);
                state.origin_memory_used_bytes = Some(s.memory_used_bytes);
                state.origin_memory_total_bytes = Some(s.memory_total_bytes);
                state.origin_net_in_bytes_per_sec = Some(s.net_in_bytes_per_sec);
                state.origin_net_out_bytes_per_sec = Some(s.net_out_bytes_per_sec);
                state.origin_nginx_requests_per_sec = Some(s.nginx_requests_per_sec);
                state.origin_nginx_connections = Some(s.nginx_connections_active);
            }
            None => {
                state.origin_cpu_percent = None;
                state.origin_memory_used_bytes = None;
                state.origin_memory_total_bytes = None;
                state.origin_net_in_bytes_per_sec = None;
                state.origin_net_out_bytes_per_sec = None;
                state.origin_nginx_requests_per_sec = None;
                state.origin_nginx_connections = None;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsState {
        self.state.read().clone()
    }
}
