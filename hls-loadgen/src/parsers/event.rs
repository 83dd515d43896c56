//! Free-form diagnostic log parser: recognizes HLS request URLs, HTTP
//! status mentions, reconnection notices, and timeout notices in FFmpeg's
//! `-loglevel verbose` output.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use super::Parser;
use crate::stats::{ClientStats, SegmentSizeCache};

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(https?://\S+)"#).expect("static regex")
});

static HTTP_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bHTTP\s*(?:error|response)?\s*(?:code)?[:\s]+(\d{3})\b").expect("static regex")
});

static RECONNECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reconnect").expect("static regex"));

static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed?\s*out|timeout").expect("static regex"));

/// Classification of a request URL by naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Manifest,
    Segment,
    Init,
    Unknown,
}

/// Classify a URL by suffix/naming, per the spec's manifest/segment/init/
/// unknown buckets.
pub fn classify_url(url: &str) -> RequestKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".m3u8") {
        RequestKind::Manifest
    } else if lower.contains("init") && (lower.ends_with(".mp4") || lower.ends_with(".m4s")) {
        RequestKind::Init
    } else if lower.ends_with(".ts") || lower.ends_with(".m4s") || lower.ends_with(".aac") {
        RequestKind::Segment
    } else {
        RequestKind::Unknown
    }
}

/// Strips query/fragment and leading path, leaving the bare filename a
/// directory-listing scrape would report (e.g. `seg_001.ts`). Segment cache
/// keys are normalized to this form on both the insert side (the segment
/// scraper's `name` field) and the lookup side, since the worker's request
/// log lines carry the full URL.
fn basename(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

/// Parses FFmpeg's diagnostic log lines, updating per-client stats and
/// resolving completed-segment byte counts via the shared segment cache.
pub struct EventParser {
    stats: Arc<ClientStats>,
    segment_cache: Arc<SegmentSizeCache>,
}

impl EventParser {
    pub fn new(stats: Arc<ClientStats>, segment_cache: Arc<SegmentSizeCache>) -> Self {
        Self { stats, segment_cache }
    }

    fn handle_request(&self, url: &str) {
        match classify_url(url) {
            RequestKind::Manifest => self.stats.record_manifest_request(),
            RequestKind::Init => self.stats.record_init_request(),
            RequestKind::Unknown => self.stats.record_unknown_request(),
            RequestKind::Segment => {
                self.stats.record_segment_request();
                // Completion triggers only when a genuinely new segment
                // request arrives; duplicate emissions are idempotent here.
                // Keyed by basename, matching the segment cache's key space.
                if let Some(completed) = self.stats.observe_segment_key(basename(url)) {
                    self.complete_segment(&completed);
                }
            }
        }
    }

    fn complete_segment(&self, segment_name: &str) {
        match self.segment_cache.get(segment_name) {
            Some(size) => {
                self.stats.record_segment_lookup(true);
                // Throughput accounting is owned solely by the Client
                // Manager's 1 Hz sampler, which sums this same
                // `bytes_downloaded` total across clients; feeding the
                // shared tracker here too would double-count.
                self.stats.add_bytes(size);
            }
            None => {
                // Cache miss: documented degradation, never synthesized.
                self.stats.record_segment_lookup(false);
            }
        }
    }
}

impl Parser for EventParser {
    fn parse_line(&mut self, line: &str) {
        if let Some(m) = URL_RE.find(line) {
            self.handle_request(m.as_str());
        }
        if let Some(caps) = HTTP_STATUS_RE.captures(line) {
            if let Some(code) = caps.get(1).and_then(|c| c.as_str().parse::<u32>().ok()) {
                self.stats.record_http_status(code);
            }
        }
        if RECONNECT_RE.is_match(line) {
            self.stats.record_reconnection();
        }
        if TIMEOUT_RE.is_match(line) {
            self.stats.record_timeout();
        }
    }
}
