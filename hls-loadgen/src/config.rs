//! Translates parsed CLI arguments into the validated, immutable
//! configuration every other component is built from.
//!
//! All fallibility in turning user input into a runnable configuration
//! lives here; once a `Config` exists, construction of the rest of the
//! crate's components is infallible.

use std::net::SocketAddr;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::client_manager::ClientManagerConfig;
use crate::cli::Args;
use crate::command_builder::{ProbeFailurePolicy, VariantPolicy, WorkerConfig};
use crate::error::ConfigError;
use crate::metrics::MetricsCollectorConfig;
use crate::scraper::{OriginScraperConfig, SegmentScraperConfig};
use crate::supervisor::SupervisorConfig;

/// Everything the orchestrator needs to run one load-generation session.
/// Built once from `Args` and never mutated afterward.
#[derive(Debug, Clone)]
pub struct Config {
    pub clients: usize,
    pub ramp_rate: f64,
    pub ramp_jitter: Duration,
    pub duration: Option<Duration>,
    pub metrics_addr: SocketAddr,
    pub per_client_gauges: bool,
    pub print_cmd: bool,
    pub check_only: bool,
    pub skip_preflight: bool,
    pub stats_enabled: bool,
    pub stats_buffer: usize,
    pub stats_drop_threshold: f64,
    pub drift_threshold: Duration,
    pub config_seed: u64,

    pub worker_config: WorkerConfig,
    pub backoff_config: BackoffConfig,
    pub supervisor_config: SupervisorConfig,
    pub origin_scraper_config: OriginScraperConfig,
    pub segment_scraper_config: SegmentScraperConfig,
}

impl Config {
    pub fn client_manager_config(&self) -> ClientManagerConfig {
        ClientManagerConfig {
            worker_config: self.worker_config.clone(),
            backoff_config: self.backoff_config.clone(),
            supervisor_config: self.supervisor_config.clone(),
            config_seed: self.config_seed,
            program_id: None,
            stall_threshold: self.drift_threshold.max(Duration::from_secs(5)),
        }
    }

    pub fn metrics_collector_config(&self) -> MetricsCollectorConfig {
        MetricsCollectorConfig {
            per_client_gauges: self.per_client_gauges,
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String), ConfigError> {
    let (k, v) = raw
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidHeader(raw.to_string()))?;
    let k = k.trim();
    let v = v.trim();
    if k.is_empty() {
        return Err(ConfigError::InvalidHeader(raw.to_string()));
    }
    Ok((k.to_string(), v.to_string()))
}

impl Args {
    /// Validate and translate this CLI invocation into a runnable `Config`.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if self.clients == 0 {
            return Err(ConfigError::ZeroClients);
        }

        let variant = VariantPolicy::parse(&self.variant)?;
        let probe_failure_policy = ProbeFailurePolicy::parse(&self.probe_failure_policy)?;

        if self.resolve.is_some() && !self.dangerous {
            return Err(ConfigError::ResolveWithoutDangerous);
        }

        let headers = self
            .header
            .iter()
            .map(|h| parse_header(h))
            .collect::<Result<Vec<_>, _>>()?;

        let metrics_addr: SocketAddr = self
            .metrics
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidMetricsAddr(self.metrics.clone(), e.to_string()))?;

        let worker_config = WorkerConfig {
            url: self.url.clone(),
            variant,
            user_agent: "hls-loadgen/0.1".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay_max: Duration::from_secs(2),
            segment_retries: 3,
            io_timeout: Duration::from_secs(15),
            headers,
            resolve: self.resolve.clone(),
            dangerous: self.dangerous,
            no_cache: self.no_cache,
            worker_binary: self.worker.clone(),
            probe_failure_policy,
        };
        worker_config.validate()?;
        if worker_config.worker_binary.trim().is_empty() {
            return Err(ConfigError::WorkerBinaryMissing(worker_config.worker_binary.clone()));
        }

        let origin_scraper_config = if self.origin_exporter.is_empty() {
            OriginScraperConfig::disabled()
        } else {
            OriginScraperConfig::new(self.origin_exporter.clone(), Duration::from_secs(2), Duration::from_secs(30))
        };

        let segment_scraper_config = SegmentScraperConfig::new(self.segment_listing.clone(), Duration::from_secs(30));

        Ok(Config {
            clients: self.clients,
            ramp_rate: self.ramp_rate,
            ramp_jitter: Duration::from_secs_f64(self.ramp_jitter.max(0.0)),
            duration: self.duration.map(Duration::from_secs_f64),
            metrics_addr,
            per_client_gauges: self.per_client_metrics,
            print_cmd: self.print_cmd,
            check_only: self.check,
            skip_preflight: self.skip_preflight,
            stats_enabled: !self.no_stats,
            stats_buffer: self.stats_buffer,
            stats_drop_threshold: self.stats_drop_threshold,
            drift_threshold: Duration::from_secs(2),
            config_seed: self.config_seed,
            worker_config,
            backoff_config: BackoffConfig::default(),
            supervisor_config: SupervisorConfig {
                line_queue_capacity: self.stats_buffer,
                ..SupervisorConfig::default()
            },
            origin_scraper_config,
            segment_scraper_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            url: "https://example.com/master.m3u8".to_string(),
            clients: 10,
            ramp_rate: 5.0,
            ramp_jitter: 0.1,
            duration: None,
            variant: "first".to_string(),
            probe_failure_policy: "fallback".to_string(),
            resolve: None,
            dangerous: false,
            no_cache: false,
            header: vec![],
            metrics: "127.0.0.1:9090".to_string(),
            per_client_metrics: false,
            tui: false,
            no_stats: false,
            stats_buffer: 256,
            stats_drop_threshold: 0.05,
            worker: "true".to_string(),
            print_cmd: false,
            check: true,
            skip_preflight: true,
            origin_exporter: vec![],
            segment_listing: None,
            config_seed: 1,
            verbose: false,
        }
    }

    #[test]
    fn zero_clients_is_rejected() {
        let mut args = base_args();
        args.clients = 0;
        assert_eq!(args.into_config().unwrap_err(), ConfigError::ZeroClients);
    }

    #[test]
    fn resolve_without_dangerous_is_rejected_before_worker_config_validates() {
        let mut args = base_args();
        args.resolve = Some("127.0.0.1".to_string());
        assert_eq!(args.into_config().unwrap_err(), ConfigError::ResolveWithoutDangerous);
    }

    #[test]
    fn malformed_header_is_rejected() {
        let mut args = base_args();
        args.header = vec!["not-a-header".to_string()];
        assert_eq!(args.into_config().unwrap_err(), ConfigError::InvalidHeader("not-a-header".to_string()));
    }

    #[test]
    fn valid_header_parses_into_pairs() {
        let mut args = base_args();
        args.header = vec!["X-Test: 1".to_string()];
        let config = args.into_config().unwrap();
        assert_eq!(config.worker_config.headers, vec![("X-Test".to_string(), "1".to_string())]);
    }

    #[test]
    fn bad_metrics_addr_is_rejected() {
        let mut args = base_args();
        args.metrics = "not-an-addr".to_string();
        assert!(matches!(args.into_config(), Err(ConfigError::InvalidMetricsAddr(..))));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let mut args = base_args();
        args.variant = "bogus".to_string();
        assert!(matches!(args.into_config(), Err(ConfigError::UnknownVariant(_))));
    }

    #[test]
    fn disabled_scrapers_when_no_urls_given() {
        let config = base_args().into_config().unwrap();
        assert!(!config.origin_scraper_config.urls.iter().any(|_| true));
        assert!(config.segment_scraper_config.url.is_none());
    }

    #[test]
    fn origin_urls_thread_through_to_scraper_config() {
        let mut args = base_args();
        args.origin_exporter = vec!["http://origin/metrics".to_string()];
        let config = args.into_config().unwrap();
        assert_eq!(config.origin_scraper_config.urls, vec!["http://origin/metrics".to_string()]);
    }
}
