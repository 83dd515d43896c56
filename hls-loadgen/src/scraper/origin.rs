//! Periodic Prometheus-text scrape of the origin/CDN's own exporters
//! (node-exporter-like + nginx-exporter-like), turned into rate metrics and
//! published for the orchestrator and metrics exposition to read.
//!
//! Published via a single `ArcSwapOption`: readers `load_full`, the scrape
//! loop `store`s a freshly built snapshot. No lock is ever held across a
//! read.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_WINDOW: Duration = Duration::from_secs(10);
const MAX_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct OriginScraperConfig {
    pub urls: Vec<String>,
    pub interval: Duration,
    pub window: Duration,
    pub timeout: Duration,
}

impl OriginScraperConfig {
    pub fn new(urls: Vec<String>, interval: Duration, window: Duration) -> Self {
        Self {
            urls,
            interval,
            window: window.clamp(MIN_WINDOW, MAX_WINDOW),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Vec::new(), Duration::from_secs(2), Duration::from_secs(30))
    }
}

/// A point-in-time published snapshot of origin health. Immutable once
/// built; the scrape loop replaces it wholesale every tick.
#[derive(Debug, Clone)]
pub struct OriginSample {
    pub scraped_at: Instant,
    pub cpu_percent: f64,
    pub memory_used_bytes: f64,
    pub memory_total_bytes: f64,
    pub net_in_bytes_per_sec: f64,
    pub net_out_bytes_per_sec: f64,
    pub nginx_requests_per_sec: f64,
    pub nginx_connections_active: f64,
    pub net_in_p50: f64,
    pub net_in_max: f64,
    pub net_out_p50: f64,
    pub net_out_max: f64,
    pub requests_p50: f64,
    pub requests_max: f64,
}

struct ParsedLine {
    name: String,
    labels: Vec<(String, String)>,
    value: f64,
}

fn parse_exposition(body: &str) -> Vec<ParsedLine> {
    body.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ParsedLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (head, value_str) = line.rsplit_once(' ')?;
    let value: f64 = value_str.parse().ok()?;
    if let Some(brace) = head.find('{') {
        let name = head[..brace].to_string();
        let end = head.rfind('}')?;
        let labels = head[brace + 1..end]
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.trim().to_string(), v.trim().trim_matches('"').to_string()))
            })
            .collect();
        Some(ParsedLine { name, labels, value })
    } else {
        Some(ParsedLine {
            name: head.trim().to_string(),
            labels: Vec::new(),
            value,
        })
    }
}

fn sum_metric(lines: &[ParsedLine], name: &str) -> Option<f64> {
    let matches: Vec<f64> = lines.iter().filter(|l| l.name == name).map(|l| l.value).collect();
    (!matches.is_empty()).then(|| matches.iter().sum())
}

fn sum_metric_labeled(lines: &[ParsedLine], name: &str, label_key: &str, label_val: &str) -> Option<f64> {
    let matches: Vec<f64> = lines
        .iter()
        .filter(|l| l.name == name && l.labels.iter().any(|(k, v)| k == label_key && v == label_val))
        .map(|l| l.value)
        .collect();
    (!matches.is_empty()).then(|| matches.iter().sum())
}

/// Raw cumulative counters and gauges read off one combined scrape of all
/// configured URLs, before rate conversion.
#[derive(Debug, Clone, Copy, Default)]
struct RawCounters {
    cpu_idle_seconds: f64,
    cpu_total_seconds: f64,
    mem_available_bytes: f64,
    mem_total_bytes: f64,
    net_rx_bytes: f64,
    net_tx_bytes: f64,
    nginx_requests: f64,
    nginx_connections: f64,
}

fn extract_raw(lines: &[ParsedLine]) -> RawCounters {
    let cpu_idle = sum_metric_labeled(lines, "node_cpu_seconds_total", "mode", "idle").unwrap_or(0.0);
    let cpu_total = sum_metric(lines, "node_cpu_seconds_total").unwrap_or(0.0);
    RawCounters {
        cpu_idle_seconds: cpu_idle,
        cpu_total_seconds: cpu_total,
        mem_available_bytes: sum_metric(lines, "node_memory_MemAvailable_bytes").unwrap_or(0.0),
        mem_total_bytes: sum_metric(lines, "node_memory_MemTotal_bytes").unwrap_or(0.0),
        net_rx_bytes: sum_metric(lines, "node_network_receive_bytes_total").unwrap_or(0.0),
        net_tx_bytes: sum_metric(lines, "node_network_transmit_bytes_total").unwrap_or(0.0),
        nginx_requests: sum_metric(lines, "nginx_http_requests_total").unwrap_or(0.0),
        nginx_connections: sum_metric(lines, "nginx_connections_active").unwrap_or(0.0),
    }
}

/// Time-stamped ring of recent rate samples, used to derive a rolling
/// P50/max without the unbounded retention a plain histogram would need
/// explicit decay logic for.
#[derive(Default)]
struct RollingSeries {
    samples: VecDeque<(Instant, f64)>,
}

impl RollingSeries {
    fn push(&mut self, at: Instant, value: f64, window: Duration) {
        self.samples.push_back((at, value));
        while let Some(&(oldest, _)) = self.samples.front() {
            if at.duration_since(oldest) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn percentile_and_max(&self, window: Duration, now: Instant) -> (f64, f64) {
        let mut values: Vec<f64> = self
            .samples
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= window)
            .map(|(_, v)| *v)
            .collect();
        if values.is_empty() {
            return (0.0, 0.0);
        }
        values.sort_by(|a, b| a.partial_cmp(b).expect("rate samples are never NaN"));
        let max = *values.last().expect("non-empty");
        let idx = ((values.len() as f64 - 1.0) * 0.5).round() as usize;
        (values[idx], max)
    }
}

/// Pulls all configured exporter URLs once per interval and publishes a
/// merged `OriginSample`. A no-op (never spawns an HTTP request) when
/// `urls` is empty.
pub struct OriginScraper {
    config: OriginScraperConfig,
    client: reqwest::Client,
    published: ArcSwapOption<OriginSample>,
}

impl OriginScraper {
    pub fn new(config: OriginScraperConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
            published: ArcSwapOption::empty(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.urls.is_empty()
    }

    pub fn latest(&self) -> Option<Arc<OriginSample>> {
        self.published.load_full()
    }

    async fn scrape_once(&self) -> Option<String> {
        if self.config.urls.is_empty() {
            return None;
        }
        let fetches = self.config.urls.iter().map(|url| {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                match client.get(&url).send().await {
                    Ok(resp) => match resp.text().await {
                        Ok(body) => Some(body),
                        Err(e) => {
                            warn!(url, error = %e, "origin scrape: failed to read response body");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(url, error = %e, "origin scrape: request failed");
                        None
                    }
                }
            }
        });
        let bodies: Vec<String> = futures::future::join_all(fetches).await.into_iter().flatten().collect();
        (!bodies.is_empty()).then(|| bodies.join("\n"))
    }

    /// Runs until cancelled. Intended to be spawned once by the
    /// orchestrator; a no-op loop (never wakes for HTTP) when disabled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.is_enabled() {
            return;
        }
        let mut prev: Option<(Instant, RawCounters)> = None;
        let mut net_in_series = RollingSeries::default();
        let mut net_out_series = RollingSeries::default();
        let mut req_series = RollingSeries::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            let Some(body) = self.scrape_once().await else { continue };
            let lines = parse_exposition(&body);
            let raw = extract_raw(&lines);
            let now = Instant::now();

            let (cpu_percent, net_in_rate, net_out_rate, req_rate) = match prev {
                Some((prev_at, prev_raw)) => {
                    let elapsed = now.duration_since(prev_at).as_secs_f64();
                    if elapsed <= 0.0 {
                        (0.0, 0.0, 0.0, 0.0)
                    } else {
                        let cpu_total_delta = (raw.cpu_total_seconds - prev_raw.cpu_total_seconds).max(0.0);
                        let cpu_idle_delta = (raw.cpu_idle_seconds - prev_raw.cpu_idle_seconds).max(0.0);
                        let cpu_percent = if cpu_total_delta > 0.0 {
                            ((cpu_total_delta - cpu_idle_delta) / cpu_total_delta * 100.0).clamp(0.0, 100.0)
                        } else {
                            0.0
                        };
                        let net_in = (raw.net_rx_bytes - prev_raw.net_rx_bytes).max(0.0) / elapsed;
                        let net_out = (raw.net_tx_bytes - prev_raw.net_tx_bytes).max(0.0) / elapsed;
                        let req = (raw.nginx_requests - prev_raw.nginx_requests).max(0.0) / elapsed;
                        (cpu_percent, net_in, net_out, req)
                    }
                }
                None => (0.0, 0.0, 0.0, 0.0),
            };
            prev = Some((now, raw));

            net_in_series.push(now, net_in_rate, self.config.window);
            net_out_series.push(now, net_out_rate, self.config.window);
            req_series.push(now, req_rate, self.config.window);

            let (net_in_p50, net_in_max) = net_in_series.percentile_and_max(self.config.window, now);
            let (net_out_p50, net_out_max) = net_out_series.percentile_and_max(self.config.window, now);
            let (requests_p50, requests_max) = req_series.percentile_and_max(self.config.window, now);

            let sample = OriginSample {
                scraped_at: now,
                cpu_percent,
                memory_used_bytes: (raw.mem_total_bytes - raw.mem_available_bytes).max(0.0),
                memory_total_bytes: raw.mem_total_bytes,
                net_in_bytes_per_sec: net_in_rate,
                net_out_bytes_per_sec: net_out_rate,
                nginx_requests_per_sec: req_rate,
                nginx_connections_active: raw.nginx_connections,
                net_in_p50,
                net_in_max,
                net_out_p50,
                net_out_max,
                requests_p50,
                requests_max,
            };
            debug!(cpu_percent, net_in_rate, net_out_rate, req_rate, "origin scrape published");
            self.published.store(Some(Arc::new(sample)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_scraper_has_no_urls() {
        let scraper = OriginScraper::new(OriginScraperConfig::disabled());
        assert!(!scraper.is_enabled());
        assert!(scraper.latest().is_none());
    }

    #[test]
    fn window_is_clamped_to_documented_bounds() {
        let config = OriginScraperConfig::new(vec!["http://x".into()], Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(config.window, MIN_WINDOW);
        let config = OriginScraperConfig::new(vec!["http://x".into()], Duration::from_secs(2), Duration::from_secs(5000));
        assert_eq!(config.window, MAX_WINDOW);
    }

    #[test]
    fn parses_labeled_and_unlabeled_lines() {
        let body = "# HELP node_cpu_seconds_total foo\n\
                     # TYPE node_cpu_seconds_total counter\n\
                     node_cpu_seconds_total{cpu=\"0\",mode=\"idle\"} 1000.5\n\
                     node_cpu_seconds_total{cpu=\"0\",mode=\"user\"} 12.25\n\
                     node_memory_MemTotal_bytes 16777216\n";
        let lines = parse_exposition(body);
        assert_eq!(sum_metric_labeled(&lines, "node_cpu_seconds_total", "mode", "idle"), Some(1000.5));
        assert_eq!(sum_metric(&lines, "node_memory_MemTotal_bytes"), Some(16777216.0));
    }

    #[test]
    fn rolling_series_keeps_only_values_within_window() {
        let mut series = RollingSeries::default();
        let base = Instant::now();
        series.push(base, 10.0, Duration::from_secs(10));
        let later = base + Duration::from_secs(20);
        series.push(later, 20.0, Duration::from_secs(10));
        let (p50, max) = series.percentile_and_max(Duration::from_secs(10), later);
        // the first sample (10.0) is outside the 10s window as of `later`.
        assert_eq!(p50, 20.0);
        assert_eq!(max, 20.0);
    }

    #[tokio::test]
    async fn run_returns_immediately_when_disabled() {
        let scraper = Arc::new(OriginScraper::new(OriginScraperConfig::disabled()));
        let cancel = CancellationToken::new();
        // Should return without ever sleeping or making a request.
        tokio::time::timeout(Duration::from_millis(200), scraper.run(cancel))
            .await
            .expect("disabled scraper must return promptly");
    }
}
