//! Top-level state machine: turns a validated `Config` into a running,
//! observed, gracefully-stoppable population of worker clients.
//!
//! States (spec §4.12): Init -> Preflight -> (ProbeVariants?) ->
//! ExpositionStarted -> Ramping -> Steady -> ShuttingDown -> Summarized.
//! The states aren't reified as an enum the caller drives — `run` walks
//! through them linearly, logging each transition, since nothing external
//! ever needs to interrupt or resume the sequence mid-way.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use m3u8_rs::Playlist;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client_manager::ClientManager;
use crate::command_builder::{CommandBuilder, ProbeFailurePolicy, VariantPolicy, WorkerConfig};
use crate::config::Config;
use crate::error::CoreError;
use crate::metrics::{MetricsCollector, PrometheusExporter};
use crate::ramp::RampScheduler;
use crate::scraper::{OriginScraper, SegmentScraper};
use crate::stats::{SegmentSizeCache, StatsAggregator, ThroughputTracker};
use crate::summary::{RunSummary, RunSummaryCollector};

/// How often the metrics-exposition snapshot and the periodic stats log
/// line are refreshed. Not user-configurable; the spec leaves the exact
/// cadence unspecified and this is short enough to feel live without
/// dominating CPU at high client counts.
const STATS_TICK: Duration = Duration::from_secs(2);

pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<RunSummary, CoreError> {
        let config = self.config;

        if !config.skip_preflight {
            info!("state: Preflight");
            preflight(&config)?;
        } else {
            info!("state: Preflight (skipped via --skip-preflight)");
        }

        let mut worker_config = config.worker_config.clone();
        let mut program_id = None;
        if worker_config.variant.requires_probe() {
            info!("state: ProbeVariants");
            program_id = match probe_variant(&worker_config).await {
                Some(id) => {
                    info!(program_id = id, "variant probe selected a program id");
                    Some(id)
                }
                None => match worker_config.probe_failure_policy {
                    ProbeFailurePolicy::Fallback => {
                        warn!("variant probe failed; falling back to the first variant");
                        worker_config.variant = VariantPolicy::First;
                        None
                    }
                    ProbeFailurePolicy::Fail => {
                        return Err(CoreError::Preflight("variant probe failed and --probe-failure-policy=fail".into()));
                    }
                },
            };
        }

        if config.print_cmd {
            let cmd = CommandBuilder::new()
                .build(&worker_config, 0, program_id)
                .map_err(CoreError::Config)?;
            println!("{}", render_command(&cmd));
            return Ok(RunSummaryCollector::new().snapshot());
        }

        if config.check_only {
            info!("configuration OK");
            return Ok(RunSummaryCollector::new().snapshot());
        }

        let cancel = CancellationToken::new();
        let segment_cache = Arc::new(SegmentSizeCache::new(4096));
        let throughput = Arc::new(ThroughputTracker::new());
        let summary = Arc::new(RunSummaryCollector::new());

        let mut manager_config = config.client_manager_config();
        manager_config.worker_config = worker_config;
        manager_config.program_id = program_id;
        let client_manager = Arc::new(ClientManager::new(
            manager_config,
            segment_cache.clone(),
            throughput.clone(),
            summary.clone(),
        ));

        let metrics_collector = Arc::new(MetricsCollector::new(config.metrics_collector_config()));
        let exporter = Arc::new(PrometheusExporter::new(metrics_collector.clone()));
        let origin_scraper = Arc::new(OriginScraper::new(config.origin_scraper_config.clone()));
        let segment_scraper = Arc::new(SegmentScraper::new(config.segment_scraper_config.clone(), segment_cache));

        info!(addr = %config.metrics_addr, "state: ExpositionStarted");
        let listener = crate::metrics::bind(config.metrics_addr).await?;
        let metrics_task = tokio::spawn(crate::metrics::serve_bound(listener, exporter, cancel.clone()));

        let sampler_task = client_manager.clone().spawn_throughput_sampler(cancel.clone());
        let origin_task = tokio::spawn(origin_scraper.clone().run(cancel.clone()));
        let segment_task = tokio::spawn(segment_scraper.clone().run(cancel.clone()));

        let ramp_started = Arc::new(AtomicUsize::new(0));
        let stats_task = spawn_stats_tick(
            client_manager.clone(),
            metrics_collector.clone(),
            origin_scraper.clone(),
            summary.clone(),
            ramp_started.clone(),
            config.clients,
            config.stats_drop_threshold,
            config.drift_threshold,
            config.stats_enabled,
            cancel.clone(),
        );

        info!(clients = config.clients, rate = config.ramp_rate, "state: Ramping");
        let ramp = RampScheduler::new(config.ramp_rate, config.ramp_jitter, config.config_seed);
        let mut cancelled_during_ramp = false;
        for slot in 0..config.clients as u64 {
            if !ramp.schedule(slot, &cancel).await {
                cancelled_during_ramp = true;
                break;
            }
            client_manager.start_client(slot);
            ramp_started.fetch_add(1, Ordering::Relaxed);
            if slot > 0 && slot % 50 == 0 {
                info!(started = slot, target = config.clients, "ramp progress");
            }
        }

        if !cancelled_during_ramp {
            info!("state: Steady");
            wait_for_quit(config.duration, &cancel).await;
        }

        info!("state: ShuttingDown");
        let deadline = Duration::from_secs(10);
        cancel.cancel();
        let shutdown_result = client_manager.shutdown(deadline).await;

        let _ = tokio::time::timeout(deadline, metrics_task).await;
        let _ = tokio::time::timeout(deadline, sampler_task).await;
        let _ = tokio::time::timeout(deadline, origin_task).await;
        let _ = tokio::time::timeout(deadline, segment_task).await;
        let _ = tokio::time::timeout(deadline, stats_task).await;

        info!("state: Summarized");
        let snapshot = summary.snapshot();
        shutdown_result?;
        Ok(snapshot)
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_stats_tick(
    client_manager: Arc<ClientManager>,
    metrics_collector: Arc<MetricsCollector>,
    origin_scraper: Arc<OriginScraper>,
    summary: Arc<RunSummaryCollector>,
    ramp_started: Arc<AtomicUsize>,
    target_count: usize,
    drop_threshold: f64,
    high_drift_threshold: Duration,
    stats_enabled: bool,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut aggregator = StatsAggregator::new(drop_threshold, high_drift_threshold);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(STATS_TICK) => {}
            }
            let stats = client_manager.snapshot(&mut aggregator, target_count);
            let started = ramp_started.load(Ordering::Relaxed) as u64;
            metrics_collector.update_from_stats(&stats, started);
            metrics_collector.update_from_summary(&summary.snapshot());
            metrics_collector.update_from_origin(origin_scraper.latest().as_deref());

            if stats_enabled {
                info!(
                    active = stats.active_count,
                    target = stats.target_count,
                    stalled = stats.stalled_count,
                    degraded = stats.degraded_clients,
                    bytes_per_sec_1s = stats.throughput.w1s,
                    "stats tick"
                );
            }
        }
    })
}

/// Waits on whichever of {duration timer, external cancellation, SIGINT,
/// SIGTERM} fires first. A dashboard's "external quit" (spec §4.12) is just
/// another `cancel.cancel()` call from whatever process embeds this crate
/// as a library; this crate's own binary never triggers it directly.
async fn wait_for_quit(duration: Option<Duration>, cancel: &CancellationToken) {
    let duration_fut = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("installing a SIGTERM handler should never fail");

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = duration_fut => { info!("duration elapsed"); }
        _ = tokio::signal::ctrl_c() => { info!("received SIGINT"); }
        #[cfg(unix)]
        _ = sigterm.recv() => { info!("received SIGTERM"); }
    }
}

/// Checks the worker binary is present and executable, and that the
/// process's `RLIMIT_NOFILE` soft limit leaves headroom for every client's
/// file descriptors (spec §4.15: up to 4 per client, plus slack for the
/// exposition listener and scrape clients).
fn preflight(config: &Config) -> Result<(), CoreError> {
    let binary = &config.worker_config.worker_binary;
    if !binary_is_executable(binary) {
        return Err(CoreError::Preflight(format!("worker binary {binary:?} not found or not executable")));
    }

    let (soft, _hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)
        .map_err(|e| CoreError::Preflight(format!("failed to read RLIMIT_NOFILE: {e}")))?;
    let required = 4 * config.clients as u64 + 64;
    if soft < required {
        return Err(CoreError::Preflight(format!(
            "RLIMIT_NOFILE soft limit ({soft}) is below the {required} file descriptors needed for {} clients",
            config.clients
        )));
    }
    Ok(())
}

fn binary_is_executable(binary: &str) -> bool {
    let path = Path::new(binary);
    if path.components().count() > 1 {
        return is_executable(path);
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(binary))
                .any(|candidate| is_executable(&candidate))
        })
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Fetches the master playlist and extracts an ordered `(program_id,
/// bandwidth)` list, one entry per variant stream, in the same order
/// FFmpeg's HLS demuxer assigns program numbers (1-based, playlist order).
/// Returns `None` on any fetch/parse failure or an empty playlist, which
/// the caller interprets as a probe failure.
async fn probe_variant(worker_config: &WorkerConfig) -> Option<u32> {
    let client = reqwest::Client::builder()
        .timeout(worker_config.connect_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let body = match client.get(&worker_config.url).send().await {
        Ok(resp) => resp.bytes().await.ok()?,
        Err(e) => {
            warn!(error = %e, "variant probe: request failed");
            return None;
        }
    };

    let variants = parse_master_playlist_bandwidths(&body);
    if variants.is_empty() {
        warn!("variant probe: no variant streams found in master playlist");
        return None;
    }

    match worker_config.variant {
        VariantPolicy::Highest => variants.into_iter().max_by_key(|(_, bw)| *bw).map(|(id, _)| id),
        VariantPolicy::Lowest => variants.into_iter().min_by_key(|(_, bw)| *bw).map(|(id, _)| id),
        VariantPolicy::All | VariantPolicy::First => None,
    }
}

/// Parses a master playlist body into an ordered `(program_id, bandwidth)`
/// list, one entry per variant stream, 1-based in playlist order. Returns an
/// empty vec for a media playlist (no variants to select among) or a body
/// that doesn't parse as HLS at all.
fn parse_master_playlist_bandwidths(body: &[u8]) -> Vec<(u32, u64)> {
    let master = match m3u8_rs::parse_playlist_res(body) {
        Ok(Playlist::MasterPlaylist(pl)) => pl,
        Ok(Playlist::MediaPlaylist(_)) => {
            warn!("variant probe: playlist is a media playlist, has no variants to select among");
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, "variant probe: failed to parse master playlist");
            return Vec::new();
        }
    };
    master
        .variants
        .iter()
        .enumerate()
        .map(|(i, v)| ((i + 1) as u32, v.bandwidth))
        .collect()
}

fn render_command(cmd: &std::process::Command) -> String {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
    std::iter::once(program).chain(args).collect::<Vec<_>>().join(" ")
}
