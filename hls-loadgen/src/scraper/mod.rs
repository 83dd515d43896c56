//! Optional side-channels that pull data out of the origin/CDN: a
//! Prometheus-text scraper for host/edge health (§4.10) and a directory
//! listing poller that feeds the segment-size cache (§4.10 bullet 6).
//!
//! Both are no-ops when their URL list is empty, so the orchestrator can
//! always construct and spawn them unconditionally.

pub mod origin;
pub mod segment;

pub use origin::{OriginSample, OriginScraper, OriginScraperConfig};
pub use segment::{SegmentScraper, SegmentScraperConfig};
