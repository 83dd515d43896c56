//! Multi-module integration tests for the scenarios in spec section 8
//! (S1-S3) that can't be exercised from a single unit's `#[cfg(test)]`
//! module: they span Ramp Scheduler + Client Manager + Supervisor +
//! Backoff + RunSummary working together, driven against a fake worker
//! binary instead of real FFmpeg.
//!
//! The fake workers are tiny `/bin/sh` scripts generated per-test into a
//! `TempDir`; `CommandBuilder` always appends FFmpeg-style flags to the
//! configured worker binary, but a shell script that never reads its own
//! arguments just ignores them, so these stand in cleanly.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use hls_loadgen::backoff::{Backoff, BackoffConfig};
use hls_loadgen::cli::Args;
use hls_loadgen::client_manager::{ClientManager, ClientManagerConfig};
use hls_loadgen::command_builder::{ProbeFailurePolicy, VariantPolicy, WorkerConfig};
use hls_loadgen::orchestrator::Orchestrator;
use hls_loadgen::stats::{ClientStats, SegmentSizeCache, ThroughputTracker};
use hls_loadgen::summary::RunSummaryCollector;
use hls_loadgen::supervisor::{Supervisor, SupervisorConfig, SupervisorEvent};

/// Writes an executable `/bin/sh` script under `dir` and returns its path.
/// The script body ignores any arguments the caller passes it, matching
/// how `CommandBuilder` always appends FFmpeg-style flags regardless of
/// what `worker_binary` actually is.
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("create fake worker script");
    writeln!(file, "#!/bin/sh").unwrap();
    write!(file, "{body}").unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn base_worker_config(worker_binary: &str) -> WorkerConfig {
    WorkerConfig {
        url: "https://example.com/master.m3u8".to_string(),
        variant: VariantPolicy::First,
        user_agent: "hls-loadgen/0.1".to_string(),
        connect_timeout: Duration::from_secs(5),
        reconnect_delay_max: Duration::from_secs(2),
        segment_retries: 3,
        io_timeout: Duration::from_secs(10),
        headers: vec![],
        resolve: None,
        dangerous: false,
        no_cache: false,
        worker_binary: worker_binary.to_string(),
        probe_failure_policy: ProbeFailurePolicy::Fallback,
    }
}

/// S1 - Happy path, 3 clients, rate 10/s, 500 ms run.
///
/// Expected (spec S1): 3 supervisors enter Running well before the run
/// ends; 0 restarts since the worker stays up; RunSummary reports
/// starts=3, restarts=0, peak active=3.
#[tokio::test]
async fn s1_happy_path_three_clients_no_restarts() {
    let dir = TempDir::new().unwrap();
    // Outlives the 500ms steady window and the shutdown deadline, so every
    // client is still Running when the run ends on its own.
    let worker = write_script(dir.path(), "stays_up.sh", "sleep 30\n");

    let mut args = Args::parse_from(["hls-loadgen", "https://example.com/master.m3u8"]);
    args.clients = 3;
    args.ramp_rate = 10.0;
    args.ramp_jitter = 0.0;
    args.duration = Some(0.5);
    args.worker = worker.to_string_lossy().into_owned();
    args.metrics = "127.0.0.1:0".to_string();
    args.skip_preflight = true;

    let config = args.into_config().expect("valid config");
    let summary = tokio::time::timeout(Duration::from_secs(5), Orchestrator::new(config).run())
        .await
        .expect("run completed within timeout")
        .expect("run succeeded");

    assert_eq!(summary.total_starts, 3);
    assert_eq!(summary.total_restarts, 0);
    assert_eq!(summary.peak_active, 3);
}

/// S2 - Crashing worker (exit code 1), 1 client, max-restarts=3.
///
/// Expected (spec S2): 4 total runs (1 initial + 3 restarts); the
/// Supervisor reports Fatal after the 3rd restart; every run exits 1.
/// Uses a much shorter crash delay than the spec's illustrative 200ms so
/// the test itself runs fast; the restart-count behavior being verified
/// doesn't depend on that delay's magnitude.
#[tokio::test]
async fn s2_crashing_worker_goes_fatal_after_max_restarts() {
    let dir = TempDir::new().unwrap();
    let worker = write_script(dir.path(), "crash.sh", "sleep 0.02\nexit 1\n");

    let worker_config = base_worker_config(&worker.to_string_lossy());
    let backoff = Backoff::new(0, 1, BackoffConfig {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(20),
        multiplier: 2.0,
        jitter_pct: 0.0,
    });
    let supervisor_config = SupervisorConfig {
        max_restarts: 3,
        event_channel_enabled: false,
        ..SupervisorConfig::default()
    };

    let (supervisor, _state_rx, mut events_rx) = Supervisor::new(
        0,
        worker_config,
        backoff,
        supervisor_config,
        std::sync::Arc::new(ClientStats::new()),
        std::sync::Arc::new(SegmentSizeCache::new(16)),
        None,
        CancellationToken::new(),
    );

    let run_task = tokio::spawn(supervisor.run());

    let mut exits = Vec::new();
    let mut restarts = 0u32;
    let mut fatal_attempts = None;
    while let Some(event) = events_rx.recv().await {
        match event {
            SupervisorEvent::Exited { exit_code, .. } => exits.push(exit_code),
            SupervisorEvent::Restarting { .. } => restarts += 1,
            SupervisorEvent::Fatal { attempts } => fatal_attempts = Some(attempts),
        }
    }

    tokio::time::timeout(Duration::from_secs(5), run_task).await.expect("supervisor finished").unwrap();

    assert_eq!(exits, vec![1, 1, 1, 1], "expected 4 total runs, all exiting 1");
    assert_eq!(restarts, 3, "expected 3 restarts before going fatal");
    assert_eq!(fatal_attempts, Some(3));
}

/// S3 - Backoff resets after a run that qualifies under `ShouldReset`.
///
/// The spec's illustrative scenario uses a 40s uptime to trigger the reset
/// branch of `ShouldReset(uptime, exitCode) = uptime >= 30s || exitCode ==
/// 0`; waiting 40 real seconds in a test is impractical, so this exercises
/// the same rule's other branch (a clean exit) to verify the same Supervisor
/// wiring: two failures advance the backoff delay, a clean-exit run resets
/// it, and the following failure's delay returns to the initial value.
#[tokio::test]
async fn s3_backoff_resets_after_a_clean_exit() {
    let dir = TempDir::new().unwrap();
    let counter_path = dir.path().join("runs");
    let worker = write_script(
        dir.path(),
        "flaky_then_clean.sh",
        &format!(
            "n=$(cat {counter} 2>/dev/null || echo 0)\n\
             n=$((n + 1))\n\
             echo \"$n\" > {counter}\n\
             sleep 0.02\n\
             if [ \"$n\" -eq 3 ]; then exit 0; else exit 1; fi\n",
            counter = counter_path.display()
        ),
    );

    let worker_config = base_worker_config(&worker.to_string_lossy());
    let backoff = Backoff::new(0, 1, BackoffConfig {
        initial: Duration::from_millis(20),
        max: Duration::from_secs(5),
        multiplier: 2.0,
        jitter_pct: 0.0,
    });
    let supervisor_config = SupervisorConfig {
        max_restarts: 3,
        event_channel_enabled: false,
        ..SupervisorConfig::default()
    };

    let (supervisor, _state_rx, mut events_rx) = Supervisor::new(
        0,
        worker_config,
        backoff,
        supervisor_config,
        std::sync::Arc::new(ClientStats::new()),
        std::sync::Arc::new(SegmentSizeCache::new(16)),
        None,
        CancellationToken::new(),
    );

    let run_task = tokio::spawn(supervisor.run());

    let mut restart_delays = Vec::new();
    while let Some(event) = events_rx.recv().await {
        if let SupervisorEvent::Restarting { delay } = event {
            restart_delays.push(delay);
        }
    }
    tokio::time::timeout(Duration::from_secs(5), run_task).await.expect("supervisor finished").unwrap();

    // Run 1 fails: backoff.next() at attempts=0 -> initial delay.
    // Run 2 fails: backoff.next() at attempts=1 -> initial * multiplier.
    // Run 3 exits cleanly: ShouldReset resets attempts to 0 before the next
    // next() call, so its delay is back down to the initial value.
    assert_eq!(restart_delays.len(), 3);
    assert_eq!(restart_delays[0], Duration::from_millis(20));
    assert_eq!(restart_delays[1], Duration::from_millis(40));
    assert_eq!(restart_delays[2], Duration::from_millis(20), "backoff should have reset after the clean exit");
}

/// Exercises the Client Manager + Ramp Scheduler path end-to-end rather
/// than the Supervisor directly: starting several clients concurrently
/// against a short-lived worker should register every one exactly once
/// and report them all as having started, with no restarts while they're
/// still completing their single (successful) run.
#[tokio::test]
async fn client_manager_starts_register_exactly_once_each() {
    let dir = TempDir::new().unwrap();
    let worker = write_script(dir.path(), "quick_success.sh", "sleep 0.05\nexit 0\n");

    let manager_config = ClientManagerConfig {
        worker_config: base_worker_config(&worker.to_string_lossy()),
        backoff_config: BackoffConfig::default(),
        supervisor_config: SupervisorConfig {
            max_restarts: 1,
            event_channel_enabled: false,
            ..SupervisorConfig::default()
        },
        config_seed: 1,
        program_id: None,
        stall_threshold: Duration::from_secs(5),
    };

    let summary = std::sync::Arc::new(RunSummaryCollector::new());
    let manager = ClientManager::new(
        manager_config,
        std::sync::Arc::new(SegmentSizeCache::new(16)),
        std::sync::Arc::new(ThroughputTracker::new()),
        summary.clone(),
    );

    for slot in 0..5u64 {
        assert!(manager.start_client(slot));
    }
    assert_eq!(manager.registered_count(), 5);
    assert_eq!(summary.snapshot().total_starts, 5);

    // Give the spawned supervisor tasks a scheduler turn to reach Running
    // before their 50ms worker exits; `start_client` itself only updates
    // peak-active from whichever clients have already transitioned by the
    // time it's called, which on a current-thread runtime is none of them
    // until something here yields.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(summary.snapshot().peak_active, 5);

    let result = manager.shutdown(Duration::from_secs(5)).await;
    assert!(result.is_ok());
}
