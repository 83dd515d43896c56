//! Polls the origin's segment directory listing (JSON array of `{name,
//! size}`) and republishes it wholesale into the shared `SegmentSizeCache`,
//! so the event parser's byte accounting has something to look up.
//!
//! A no-op when no URL is configured: the cache simply stays empty forever,
//! and segment lookups degrade gracefully per the parser's documented
//! cache-miss behavior.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::stats::SegmentSizeCache;

#[derive(Debug, Clone)]
pub struct SegmentScraperConfig {
    pub url: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl SegmentScraperConfig {
    pub fn new(url: Option<String>, interval: Duration) -> Self {
        Self {
            url,
            interval,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(30))
    }
}

#[derive(Debug, Deserialize)]
struct SegmentEntry {
    name: String,
    size: u64,
}

pub struct SegmentScraper {
    config: SegmentScraperConfig,
    client: reqwest::Client,
    cache: Arc<SegmentSizeCache>,
}

impl SegmentScraper {
    pub fn new(config: SegmentScraperConfig, cache: Arc<SegmentSizeCache>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
            cache,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.url.is_some()
    }

    async fn scrape_once(&self, url: &str) {
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(url, error = %e, "segment size scrape: request failed");
                return;
            }
        };
        let entries: Vec<SegmentEntry> = match resp.json().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(url, error = %e, "segment size scrape: invalid JSON body");
                return;
            }
        };
        let count = entries.len();
        self.cache.replace_all(entries.into_iter().map(|e| (e.name, e.size)));
        tracing::debug!(url, count, "segment size cache refreshed");
    }

    /// Runs until cancelled. A no-op loop (never makes a request) when no
    /// URL is configured.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(url) = self.config.url.clone() else {
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            self.scrape_once(&url).await;
        }
    }
}
