//! Metrics Collector & Exposition (spec §4.11): turns periodic
//! `AggregatedStats`/`RunSummary` pulls into named Prometheus series and
//! serves them over HTTP.
//!
//! Split the same way the teacher splits its own metrics surface:
//! `collector` owns the atomic/`DashMap` state and the update logic,
//! `prometheus` renders a collector snapshot to text, `server` wires the
//! renderer behind a single `axum` route.

pub mod collector;
pub mod prometheus;
pub mod server;

pub use collector::{MetricsCollector, MetricsCollectorConfig};
pub use prometheus::PrometheusExporter;
pub use server::{bind, serve, serve_bound};
