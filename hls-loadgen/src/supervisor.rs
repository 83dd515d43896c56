//! Per-worker lifecycle manager: build -> spawn -> read/parse -> wait ->
//! decide-restart -> back off -> spawn again.
//!
//! Owns its worker process exclusively: no other component signals or
//! waits on it. Never blocks the worker it supervises — pipeline
//! backpressure is handled entirely inside the parser pipelines.

use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backoff::Backoff;
use crate::command_builder::{ClientId, CommandBuilder, WorkerConfig};
use crate::parsers::{EventParser, ProgressParser};
use crate::process::{BoundedLineQueue, LineSource, ParserPipeline, PipelineCounters};
use crate::stats::{ClientStats, SegmentSizeCache};

/// Supervisor finite state. Transitions fire on `state_tx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Starting,
    Running,
    Exited,
    Backoff,
    Stopped,
}

impl SupervisorState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Backoff)
    }
}

/// Lifecycle events a Supervisor reports out to its owner (the Client
/// Manager). These never carry failure information the manager has to act
/// on — the supervisor already recovered locally.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Exited { exit_code: i32, uptime: Duration },
    Restarting { delay: Duration },
    Fatal { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub event_channel_enabled: bool,
    pub drain_timeout: Duration,
    pub stop_timeout: Duration,
    pub line_queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 0, // 0 == unlimited
            event_channel_enabled: true,
            drain_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            line_queue_capacity: crate::process::pipeline::DEFAULT_CAPACITY,
        }
    }
}

struct RunOutcome {
    exit_code: i32,
    uptime: Duration,
    event_counters: Option<Arc<PipelineCounters>>,
    log_counters: Arc<PipelineCounters>,
}

pub struct Supervisor {
    client_id: ClientId,
    worker_config: WorkerConfig,
    backoff: Backoff,
    config: SupervisorConfig,
    stats: Arc<ClientStats>,
    segment_cache: Arc<SegmentSizeCache>,
    program_id: Option<u32>,
    state_tx: watch::Sender<SupervisorState>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    cancel: CancellationToken,
    child_pgid: Arc<parking_lot::Mutex<Option<i32>>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: ClientId,
        worker_config: WorkerConfig,
        backoff: Backoff,
        config: SupervisorConfig,
        stats: Arc<ClientStats>,
        segment_cache: Arc<SegmentSizeCache>,
        program_id: Option<u32>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<SupervisorState>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (state_tx, state_rx) = watch::channel(SupervisorState::Created);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sup = Self {
            client_id,
            worker_config,
            backoff,
            config,
            stats,
            segment_cache,
            program_id,
            state_tx,
            events_tx,
            cancel,
            child_pgid: Arc::new(parking_lot::Mutex::new(None)),
        };
        (sup, state_rx, events_rx)
    }

    fn set_state(&self, state: SupervisorState) {
        let _ = self.state_tx.send(state);
    }

    /// Between-runs loop: spawn, wait, decide whether to restart, back off.
    ///
    /// `attempts` counts restarts already *granted*, not runs completed — a
    /// run is always executed unconditionally once reached, and only the
    /// decision to grant another one is gated on `max_restarts`. With
    /// `max_restarts = N` this allows `N + 1` total runs (the initial run
    /// plus N restarts) before going fatal, matching "max-restarts=3" ⇒ 4
    /// total runs, fatal after the 3rd restart.
    pub async fn run(mut self) {
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.set_state(SupervisorState::Stopped);
                return;
            }

            let outcome = match self.run_once().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Build/spawn/pipe errors count as a failed attempt and fall
                    // through to the backoff loop like a process failure.
                    warn!(client_id = self.client_id, error = %e, "run_once failed");
                    if self.config.max_restarts > 0 && attempts >= self.config.max_restarts {
                        self.set_state(SupervisorState::Stopped);
                        let _ = self.events_tx.send(SupervisorEvent::Fatal { attempts });
                        return;
                    }
                    let delay = self.backoff.next();
                    let _ = self.events_tx.send(SupervisorEvent::Restarting { delay });
                    self.set_state(SupervisorState::Backoff);
                    attempts += 1;
                    if self.sleep_or_cancel(delay).await {
                        self.set_state(SupervisorState::Stopped);
                        return;
                    }
                    continue;
                }
            };

            if let (Some(ev), Some(lg)) = (outcome.event_counters.as_ref(), Some(&outcome.log_counters)) {
                self.stats.set_event_pipeline_counts(ev.lines_read(), ev.lines_dropped());
                self.stats.set_log_pipeline_counts(lg.lines_read(), lg.lines_dropped());
            } else {
                self.stats
                    .set_log_pipeline_counts(outcome.log_counters.lines_read(), outcome.log_counters.lines_dropped());
            }

            let _ = self.events_tx.send(SupervisorEvent::Exited {
                exit_code: outcome.exit_code,
                uptime: outcome.uptime,
            });

            if Backoff::should_reset(outcome.uptime, outcome.exit_code) {
                self.backoff.reset();
            }

            if self.cancel.is_cancelled() {
                self.set_state(SupervisorState::Stopped);
                return;
            }

            if self.config.max_restarts > 0 && attempts >= self.config.max_restarts {
                self.set_state(SupervisorState::Stopped);
                let _ = self.events_tx.send(SupervisorEvent::Fatal { attempts });
                return;
            }

            let delay = self.backoff.next();
            let _ = self.events_tx.send(SupervisorEvent::Restarting { delay });
            self.set_state(SupervisorState::Backoff);
            attempts += 1;
            if self.sleep_or_cancel(delay).await {
                self.set_state(SupervisorState::Stopped);
                return;
            }
        }
    }

    /// Sleeps for `delay`, honoring cancellation. Returns `true` if
    /// cancelled mid-sleep.
    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    async fn run_once(&mut self) -> anyhow::Result<RunOutcome> {
        self.set_state(SupervisorState::Starting);

        let mut builder = CommandBuilder::new();
        let event_pipe = if self.config.event_channel_enabled {
            builder.set_event_channel_fd(3);
            Some(nix::unistd::pipe()?)
        } else {
            None
        };

        let cmd_std = builder.build(&self.worker_config, self.client_id, self.program_id)?;
        let mut cmd = TokioCommand::from(cmd_std);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.process_group(0); // new process group, so a group signal hits only this worker's tree

        if let Some((_read_end, write_end)) = &event_pipe {
            let raw = write_end.as_raw_fd();
            // SAFETY: dup2/close are async-signal-safe; this runs in the
            // child between fork and exec, before any other code runs.
            unsafe {
                cmd.pre_exec(move || {
                    if raw != 3 {
                        nix::unistd::dup2(raw, 3).map_err(std::io::Error::from)?;
                        nix::unistd::close(raw).map_err(std::io::Error::from)?;
                    }
                    Ok(())
                });
            }
        }

        let start = Instant::now();
        let mut child = cmd.spawn()?;
        let pid = child.id();
        *self.child_pgid.lock() = pid.map(|p| p as i32);

        // Close the parent's copy of the write end now that the child has
        // started; only the child's duplicated fd 3 keeps the pipe open,
        // so EOF arrives exactly when the child exits.
        let event_read = event_pipe.map(|(read_end, write_end)| {
            drop(write_end);
            read_end
        });

        self.set_state(SupervisorState::Running);

        let log_reader = child.stderr.take().expect("stderr piped");
        let mut log_queue = BoundedLineQueue::new(self.config.line_queue_capacity);
        let log_producer = log_queue.producer();
        let log_rx = log_queue.take_receiver();
        let log_counters = log_queue.counters();
        let log_source = LineSource::new(log_reader, log_producer);
        let log_parser = EventParser::new(self.stats.clone(), self.segment_cache.clone());
        let log_pipeline = ParserPipeline::new(log_rx, log_parser, log_counters.clone());

        let log_source_task = tokio::spawn(log_source.run());
        let log_pipeline_task = tokio::spawn(log_pipeline.run());

        let (event_counters, event_source_task, event_pipeline_task) = if let Some(read_end) = event_read {
            let mut event_queue = BoundedLineQueue::new(self.config.line_queue_capacity);
            let event_producer = event_queue.producer();
            let event_rx = event_queue.take_receiver();
            let event_counters = event_queue.counters();
            let stats = self.stats.clone();

            // Read the anonymous pipe synchronously on a blocking thread,
            // matching the teacher's spawn_blocking channel pattern; this
            // avoids needing the raw fd to participate in the async reactor.
            let source_task = tokio::task::spawn_blocking(move || {
                let file = std::fs::File::from(read_end);
                let mut reader = std::io::BufReader::new(file);
                read_blocking_lines(&mut reader, &event_producer)
            });

            let parser = ProgressParser::new(stats);
            let pipeline = ParserPipeline::new(event_rx, parser, event_counters.clone());
            let pipeline_task = tokio::spawn(pipeline.run());
            (Some(event_counters), Some(source_task), Some(pipeline_task))
        } else {
            (None, None, None)
        };

        let wait_result = tokio::select! {
            status = child.wait() => status,
            _ = self.cancel.cancelled() => {
                self.stop_child(&mut child, pid, self.config.stop_timeout).await
            }
        };

        let uptime = start.elapsed();
        let exit_code = match wait_result {
            Ok(status) => exit_code_of(status),
            Err(_) => -1,
        };

        let _ = tokio::time::timeout(self.config.drain_timeout, log_source_task).await;
        let _ = tokio::time::timeout(self.config.drain_timeout, log_pipeline_task).await;
        if let Some(t) = event_source_task {
            let _ = tokio::time::timeout(self.config.drain_timeout, t).await;
        }
        if let Some(t) = event_pipeline_task {
            let _ = tokio::time::timeout(self.config.drain_timeout, t).await;
        }

        self.set_state(SupervisorState::Exited);

        Ok(RunOutcome {
            exit_code,
            uptime,
            event_counters,
            log_counters,
        })
    }

    /// SIGTERM the worker's process group, give it `timeout` to exit on its
    /// own, then SIGKILL and reap. Runs only after `self.cancel` fires.
    async fn stop_child(
        &self,
        child: &mut tokio::process::Child,
        pid: Option<u32>,
        timeout: Duration,
    ) -> std::io::Result<std::process::ExitStatus> {
        let Some(pid) = pid else {
            return child.wait().await;
        };
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGTERM);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
                child.wait().await
            }
        }
    }

    /// Sends SIGTERM then SIGKILL to the worker's process group. Idempotent:
    /// signaling a process group with no live members is a harmless no-op.
    pub fn stop(&self, timeout: Duration) {
        if let Some(pid) = *self.child_pgid.lock() {
            let pgid = nix::unistd::Pid::from_raw(pid);
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGTERM);
            let pgid2 = pgid;
            let timeout = timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = nix::sys::signal::killpg(pgid2, nix::sys::signal::Signal::SIGKILL);
            });
        }
        self.cancel.cancel();
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        -1
    }
}

/// Synchronous line reader for the anonymous event pipe, run inside
/// `spawn_blocking`. Mirrors `LineSource`'s split/cap/drop semantics without
/// requiring the raw fd to be registered with the async reactor.
fn read_blocking_lines<R: std::io::BufRead>(
    reader: &mut R,
    producer: &crate::process::pipeline::LineProducer,
) -> u64 {
    use std::io::BufRead as _;
    let mut oversize = 0u64;
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                } else {
                    break;
                }
                if buf.len() <= crate::process::line_source::MAX_LINE_LEN {
                    producer.push(std::mem::take(&mut buf));
                } else {
                    oversize += 1;
                    for chunk in buf.chunks(crate::process::line_source::MAX_LINE_LEN) {
                        producer.push(chunk.to_vec());
                    }
                }
            }
            Err(_) => break,
        }
    }
    oversize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_translation_for_signal_deaths() {
        let status = std::process::Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .expect("sh available");
        assert!(status.code().is_none());
        assert_eq!(exit_code_of(status), 128 + 15);
    }

    #[test]
    fn exit_code_translation_for_normal_exit() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .status()
            .expect("sh available");
        assert_eq!(exit_code_of(status), 7);
    }

    #[tokio::test]
    async fn supervisor_state_starts_created() {
        let (sup, rx, _events) = Supervisor::new(
            0,
            crate::command_builder::WorkerConfig {
                url: "https://example.com/master.m3u8".into(),
                variant: crate::command_builder::VariantPolicy::First,
                user_agent: "hls-loadgen/0.1".into(),
                connect_timeout: Duration::from_secs(5),
                reconnect_delay_max: Duration::from_secs(2),
                segment_retries: 3,
                io_timeout: Duration::from_secs(10),
                headers: vec![],
                resolve: None,
                dangerous: false,
                no_cache: false,
                worker_binary: "true".into(),
                probe_failure_policy: crate::command_builder::ProbeFailurePolicy::Fallback,
            },
            Backoff::new(0, 1, crate::backoff::BackoffConfig::default()),
            SupervisorConfig::default(),
            Arc::new(ClientStats::new()),
            Arc::new(SegmentSizeCache::new(16)),
            None,
            CancellationToken::new(),
        );
        assert_eq!(*rx.borrow(), SupervisorState::Created);
        drop(sup);
    }
}
