//! Owns the live set of worker supervisors: starts them, tracks their
//! state, aggregates their stats on demand, and tears them all down on
//! shutdown.
//!
//! Mirrors the teacher's actor registry (`JoinHandle` per entry in a
//! concurrent map) generalized from a fixed live-streaming session set to
//! an elastic pool of HLS playback clients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::command_builder::{ClientId, WorkerConfig};
use crate::error::CoreError;
use crate::stats::{AggregatedStats, ClientStats, ClientView, SegmentSizeCache, StatsAggregator, ThroughputTracker};
use crate::summary::RunSummaryCollector;
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorEvent, SupervisorState};

struct ClientHandle {
    stats: Arc<ClientStats>,
    state_rx: watch::Receiver<SupervisorState>,
    cancel: CancellationToken,
    run_task: JoinHandle<()>,
    events_task: JoinHandle<()>,
}

/// Shared configuration applied to every client started by this manager.
#[derive(Clone)]
pub struct ClientManagerConfig {
    pub worker_config: WorkerConfig,
    pub backoff_config: BackoffConfig,
    pub supervisor_config: SupervisorConfig,
    pub config_seed: u64,
    pub program_id: Option<u32>,
    /// A client with no progress update for this long is considered
    /// stalled in aggregate snapshots.
    pub stall_threshold: Duration,
}

pub struct ClientManager {
    clients: DashMap<ClientId, ClientHandle>,
    config: ClientManagerConfig,
    segment_cache: Arc<SegmentSizeCache>,
    throughput: Arc<ThroughputTracker>,
    summary: Arc<RunSummaryCollector>,
}

impl ClientManager {
    pub fn new(
        config: ClientManagerConfig,
        segment_cache: Arc<SegmentSizeCache>,
        throughput: Arc<ThroughputTracker>,
        summary: Arc<RunSummaryCollector>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            config,
            segment_cache,
            throughput,
            summary,
        }
    }

    /// Start one client. Idempotent: starting an already-registered
    /// `client_id` is a no-op and returns `false`.
    pub fn start_client(&self, client_id: ClientId) -> bool {
        if self.clients.contains_key(&client_id) {
            return false;
        }

        let stats = Arc::new(ClientStats::new());
        let backoff = Backoff::new(client_id, self.config.config_seed, self.config.backoff_config.clone());
        let cancel = CancellationToken::new();

        let (supervisor, state_rx, mut events_rx) = Supervisor::new(
            client_id,
            self.config.worker_config.clone(),
            backoff,
            self.config.supervisor_config.clone(),
            stats.clone(),
            self.segment_cache.clone(),
            self.config.program_id,
            cancel.clone(),
        );

        self.summary.record_start();
        let run_task = tokio::spawn(supervisor.run());

        let summary = self.summary.clone();
        let events_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    SupervisorEvent::Exited { exit_code, uptime } => {
                        summary.record_exit(exit_code, uptime);
                    }
                    SupervisorEvent::Restarting { .. } => {
                        summary.record_restart();
                    }
                    SupervisorEvent::Fatal { attempts } => {
                        summary.record_fatal();
                        warn!(client_id, attempts, "client gave up after exhausting max restarts");
                    }
                }
            }
        });

        self.clients.insert(
            client_id,
            ClientHandle {
                stats,
                state_rx,
                cancel,
                run_task,
                events_task,
            },
        );
        // Update peak-active immediately rather than waiting for the next
        // periodic stats tick, so a run shorter than one tick interval still
        // reports an accurate peak in its RunSummary.
        self.summary.observe_active(self.active_count());
        true
    }

    pub fn active_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().state_rx.borrow().is_active())
            .count()
    }

    pub fn registered_count(&self) -> usize {
        self.clients.len()
    }

    /// Spawn the manager's 1 Hz throughput sampler: sums current
    /// bytes-downloaded across every registered client and feeds the delta
    /// since the last tick into the shared `ThroughputTracker`, whose
    /// rolling windows are read back out on every `snapshot()` call.
    pub fn spawn_throughput_sampler(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut prev_total = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                let total: u64 = self.clients.iter().map(|entry| entry.value().stats.bytes_downloaded()).sum();
                let delta = total.saturating_sub(prev_total);
                prev_total = total;
                self.throughput.record_tick(delta);
            }
        })
    }

    /// Build a fresh aggregate snapshot from current registry state.
    pub fn snapshot(&self, aggregator: &mut StatsAggregator, target_count: usize) -> AggregatedStats {
        let now = Instant::now();
        let stall_threshold = self.config.stall_threshold;
        // Collect owned Arc<ClientStats> first so the view borrows don't
        // outlive the dashmap shard guards.
        let entries: Vec<(ClientId, bool, Arc<ClientStats>)> = self
            .clients
            .iter()
            .map(|entry| {
                let is_active = entry.value().state_rx.borrow().is_active();
                (*entry.key(), is_active, entry.value().stats.clone())
            })
            .collect();

        let views: Vec<ClientView> = entries
            .iter()
            .map(|(client_id, is_active, stats)| {
                let is_stalled = stats
                    .last_progress_at()
                    .map(|t| now.duration_since(t) >= stall_threshold)
                    .unwrap_or(false);
                ClientView {
                    client_id: *client_id,
                    is_active: *is_active,
                    is_stalled,
                    stats: stats.as_ref(),
                }
            })
            .collect();

        self.summary.observe_active(self.active_count());
        aggregator.snapshot(views, target_count, &self.throughput)
    }

    /// Cancel every client and wait up to `deadline` for all supervisor
    /// tasks to finish. Returns `IncompleteShutdown` if any are still
    /// running when the deadline expires.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), CoreError> {
        let client_ids: Vec<ClientId> = self.clients.iter().map(|e| *e.key()).collect();
        for id in &client_ids {
            if let Some(handle) = self.clients.get(id) {
                handle.cancel.cancel();
            }
        }

        let deadline_at = Instant::now() + deadline;
        let mut incomplete = false;
        for id in client_ids {
            if let Some((_, handle)) = self.clients.remove(&id) {
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                if tokio::time::timeout(remaining, handle.run_task).await.is_err() {
                    incomplete = true;
                    continue;
                }
                // Events task finishes shortly after run_task drops its sender;
                // give it the same remaining budget, best-effort.
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                let _ = tokio::time::timeout(remaining, handle.events_task).await;
            }
        }

        if incomplete {
            Err(CoreError::IncompleteShutdown)
        } else {
            info!("all clients shut down cleanly");
            Ok(())
        }
    }
}
