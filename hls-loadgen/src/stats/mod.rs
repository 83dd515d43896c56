//! Lock-free per-client counters, rolling throughput windows, and the
//! snapshot aggregator that turns both into a consistent point-in-time view.

pub mod aggregator;
pub mod client_stats;
pub mod segment_cache;
pub mod throughput;

pub use aggregator::{AggregatedStats, ClientView, StatsAggregator, ThroughputWindows};
pub use client_stats::{ClientStats, ClientSummary, ProgressSample};
pub use segment_cache::SegmentSizeCache;
pub use throughput::ThroughputTracker;
