//! Produces `AggregatedStats` snapshots on demand from a client registry's
//! live atomic counters. Snapshot generation is infallible — aggregation
//! must never fail, per the spec's error taxonomy.

use std::time::{Duration, Instant};

use super::client_stats::ClientSummary;
use super::throughput::ThroughputTracker;

/// Rolling-window definitions reported in every snapshot.
pub const WINDOWS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

#[derive(Debug, Clone)]
pub struct ThroughputWindows {
    pub w1s: f64,
    pub w30s: f64,
    pub w60s: f64,
    pub w300s: f64,
    pub overall: f64,
}

/// A point-in-time, immutable snapshot. Consumers hold this; they never
/// hold a live reference into the registry.
#[derive(Debug, Clone)]
pub struct AggregatedStats {
    pub active_count: usize,
    pub target_count: usize,
    pub stalled_count: usize,
    pub total_bytes: u64,
    pub instant_bytes_per_sec: f64,
    pub count_above_realtime: usize,
    pub count_below_realtime: usize,
    pub clients_with_high_drift: usize,
    pub total_lines_read: u64,
    pub total_lines_dropped: u64,
    pub degraded_clients: usize,
    pub throughput: ThroughputWindows,
    pub per_client: Vec<ClientSummary>,
}

/// Stateful aggregator: remembers the previous total-bytes/time pair so it
/// can compute an instant rate guarded against clock jumps (a rate is only
/// reported when elapsed time is positive and not absurdly small).
pub struct StatsAggregator {
    drop_threshold: f64,
    high_drift_threshold: Duration,
    prev_total: u64,
    prev_at: Instant,
}

impl StatsAggregator {
    pub fn new(drop_threshold: f64, high_drift_threshold: Duration) -> Self {
        Self {
            drop_threshold,
            high_drift_threshold,
            prev_total: 0,
            prev_at: Instant::now(),
        }
    }

    /// Build a fresh `AggregatedStats` from the current registry state.
    ///
    /// `clients` yields `(is_active, is_stalled, &ClientStats, event_counters, log_counters)`
    /// for every registered client; `throughput` is the manager-wide
    /// tracker fed by the 1 Hz sampler.
    pub fn snapshot<'a, I>(
        &mut self,
        clients: I,
        target_count: usize,
        throughput: &ThroughputTracker,
    ) -> AggregatedStats
    where
        I: IntoIterator<Item = ClientView<'a>>,
    {
        let mut active_count = 0usize;
        let mut stalled_count = 0usize;
        let mut total_bytes = 0u64;
        let mut count_above = 0usize;
        let mut count_below = 0usize;
        let mut high_drift = 0usize;
        let mut lines_read = 0u64;
        let mut lines_dropped = 0u64;
        let mut degraded = 0usize;
        let mut per_client = Vec::new();

        for view in clients {
            if view.is_active {
                active_count += 1;
            }
            if view.is_stalled {
                stalled_count += 1;
            }
            let mut summary: ClientSummary = view.stats.into();
            summary.client_id = view.client_id;
            total_bytes += summary.bytes_downloaded;

            if summary.last_speed > 1.0 {
                count_above += 1;
            } else if summary.last_speed > 0.0 && summary.last_speed < 1.0 {
                count_below += 1;
            }
            if summary.last_drift >= self.high_drift_threshold {
                high_drift += 1;
            }

            let read = summary.event_lines_read + summary.log_lines_read;
            let dropped = summary.event_lines_dropped + summary.log_lines_dropped;
            lines_read += read;
            lines_dropped += dropped;
            if read > 0 && (dropped as f64 / read.max(1) as f64) > self.drop_threshold {
                degraded += 1;
            }

            per_client.push(summary);
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.prev_at).as_secs_f64();
        let current_total = throughput.total();
        let instant_rate = if elapsed > 0.01 && current_total >= self.prev_total {
            (current_total - self.prev_total) as f64 / elapsed
        } else {
            0.0
        };
        self.prev_total = current_total;
        self.prev_at = now;

        AggregatedStats {
            active_count,
            target_count,
            stalled_count,
            total_bytes,
            instant_bytes_per_sec: instant_rate,
            count_above_realtime: count_above,
            count_below_realtime: count_below,
            clients_with_high_drift: high_drift,
            total_lines_read: lines_read,
            total_lines_dropped: lines_dropped,
            degraded_clients: degraded,
            throughput: ThroughputWindows {
                w1s: throughput.rolling_average(WINDOWS[0]),
                w30s: throughput.rolling_average(WINDOWS[1]),
                w60s: throughput.rolling_average(WINDOWS[2]),
                w300s: throughput.rolling_average(WINDOWS[3]),
                overall: throughput.overall_average(),
            },
            per_client,
        }
    }
}

pub struct ClientView<'a> {
    pub client_id: crate::command_builder::ClientId,
    pub is_active: bool,
    pub is_stalled: bool,
    pub stats: &'a super::client_stats::ClientStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::client_stats::ClientStats;

    #[test]
    fn snapshot_is_infallible_on_empty_registry() {
        let mut agg = StatsAggregator::new(0.01, Duration::from_secs(2));
        let throughput = ThroughputTracker::new();
        let snap = agg.snapshot(std::iter::empty(), 0, &throughput);
        assert_eq!(snap.active_count, 0);
        assert_eq!(snap.total_bytes, 0);
    }

    #[test]
    fn aggregates_counts_across_clients() {
        let mut agg = StatsAggregator::new(0.01, Duration::from_secs(2));
        let throughput = ThroughputTracker::new();
        let s1 = ClientStats::new();
        s1.add_bytes(100);
        let s2 = ClientStats::new();
        s2.add_bytes(200);

        let views = vec![
            ClientView { client_id: 0, is_active: true, is_stalled: false, stats: &s1 },
            ClientView { client_id: 1, is_active: true, is_stalled: false, stats: &s2 },
        ];
        let snap = agg.snapshot(views, 2, &throughput);
        assert_eq!(snap.active_count, 2);
        assert_eq!(snap.total_bytes, 300);
        assert_eq!(snap.per_client.len(), 2);
    }
}
