//! Pure construction of the FFmpeg invocation that performs one HLS
//! playback-and-discard run.
//!
//! The builder never touches the filesystem or network itself; it only
//! assembles argv. All variability (variant policy, resolve override,
//! headers) is captured in `WorkerConfig` and `ClientId`/program-id inputs so
//! the same inputs always produce the same command.

use std::time::Duration;

use process_utils::std_command;

use crate::error::ConfigError;

/// Variant-selection policy for the worker's playlist handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantPolicy {
    All,
    Highest,
    Lowest,
    First,
}

impl VariantPolicy {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "all" => Ok(Self::All),
            "highest" => Ok(Self::Highest),
            "lowest" => Ok(Self::Lowest),
            "first" => Ok(Self::First),
            other => Err(ConfigError::UnknownVariant(other.to_string())),
        }
    }

    /// Whether this policy requires a prior variant probe to select a
    /// program id before a worker command can be built.
    pub fn requires_probe(self) -> bool {
        matches!(self, Self::Highest | Self::Lowest)
    }
}

/// What to do when a required variant probe fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailurePolicy {
    Fallback,
    Fail,
}

impl ProbeFailurePolicy {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "fallback" => Ok(Self::Fallback),
            "fail" => Ok(Self::Fail),
            other => Err(ConfigError::UnknownProbePolicy(other.to_string())),
        }
    }
}

/// Immutable per-run worker configuration, frozen before the first worker
/// spawns.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub url: String,
    pub variant: VariantPolicy,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub reconnect_delay_max: Duration,
    pub segment_retries: u32,
    pub io_timeout: Duration,
    pub headers: Vec<(String, String)>,
    pub resolve: Option<String>,
    pub dangerous: bool,
    pub no_cache: bool,
    pub worker_binary: String,
    pub probe_failure_policy: ProbeFailurePolicy,
}

impl WorkerConfig {
    /// Validate configuration invariants that the builder itself enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolve.is_some() && !self.dangerous {
            return Err(ConfigError::ResolveWithoutDangerous);
        }
        Ok(())
    }
}

/// Dense client identifier, stable for the process lifetime.
pub type ClientId = u64;

/// Pure builder for a single worker invocation.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    event_channel_fd: Option<i32>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self {
            event_channel_fd: None,
        }
    }
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use file descriptor `n` (typically 3) for structured progress output.
    pub fn set_event_channel_fd(&mut self, n: i32) {
        self.event_channel_fd = Some(n);
    }

    /// Build the argv for one worker run.
    ///
    /// `program_id` must be `Some` when `config.variant` requires a probe
    /// (`highest`/`lowest`); it is ignored for `all`/`first`.
    pub fn build(
        &self,
        config: &WorkerConfig,
        _client_id: ClientId,
        program_id: Option<u32>,
    ) -> Result<std::process::Command, ConfigError> {
        config.validate()?;

        if config.variant.requires_probe() && program_id.is_none() {
            return Err(ConfigError::ProgramIdRequired);
        }
        if config.worker_binary.trim().is_empty() {
            return Err(ConfigError::WorkerBinaryMissing(config.worker_binary.clone()));
        }

        let mut cmd = std_command(&config.worker_binary);
        cmd.arg("-hide_banner").arg("-nostdin");

        // Structured progress: key=value stream ending with progress=(continue|end).
        match self.event_channel_fd {
            Some(fd) => {
                cmd.arg("-progress").arg(format!("pipe:{fd}"));
            }
            None => {
                cmd.arg("-progress").arg("pipe:2");
            }
        }
        cmd.arg("-loglevel").arg("verbose").arg("-stats");

        // Reconnection, always on for streamed HLS input.
        cmd.arg("-reconnect")
            .arg("1")
            .arg("-reconnect_streamed")
            .arg("1")
            .arg("-reconnect_delay_max")
            .arg(self.seconds(config.reconnect_delay_max))
            .arg("-reconnect_on_network_error")
            .arg("1");

        cmd.arg("-rw_timeout")
            .arg((config.io_timeout.as_micros() as u64).to_string());

        if config.segment_retries > 0 {
            cmd.arg("-http_persistent").arg("0");
        }

        cmd.arg("-user_agent").arg(&config.user_agent);

        let mut header_blob = String::new();
        if config.no_cache {
            header_blob.push_str("Cache-Control: no-cache\r\n");
            header_blob.push_str("Pragma: no-cache\r\n");
        }
        for (k, v) in &config.headers {
            header_blob.push_str(k);
            header_blob.push_str(": ");
            header_blob.push_str(v);
            header_blob.push_str("\r\n");
        }
        if !header_blob.is_empty() {
            cmd.arg("-headers").arg(header_blob);
        }

        if let Some(ip) = &config.resolve {
            // Caller has already enforced `--dangerous` via validate().
            let host = url::Url::parse(&config.url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_default();
            cmd.arg("-resolve").arg(format!("{host}:0:{ip}"));
            cmd.arg("-tls_verify").arg("0");
        }

        match config.variant {
            VariantPolicy::All => {
                cmd.arg("-i").arg(&config.url);
            }
            VariantPolicy::First => {
                cmd.arg("-i").arg(&config.url);
            }
            VariantPolicy::Highest | VariantPolicy::Lowest => {
                let pid = program_id.expect("checked above");
                cmd.arg("-programid").arg(pid.to_string());
                cmd.arg("-i").arg(&config.url);
            }
        }

        // Null output sink: we never decode or buffer media.
        cmd.arg("-f").arg("null").arg("-");

        Ok(cmd)
    }

    fn seconds(&self, d: Duration) -> String {
        d.as_secs().to_string()
    }
}
