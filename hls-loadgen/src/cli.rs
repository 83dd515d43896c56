//! Command-line surface. `Args` mirrors the documented CLI behavior
//! one-to-one; all fallible interpretation (parsing strings into policies,
//! validating combinations) happens in `config::Args::into_config`, not
//! here — this module only describes shape and defaults.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "hls-loadgen", version, about = "Concurrent HLS viewer load generator driven by FFmpeg worker subprocesses")]
pub struct Args {
    /// HLS master or media playlist URL to load-test.
    pub url: String,

    /// Number of concurrent viewer clients to ramp up to.
    #[arg(long, default_value_t = 10)]
    pub clients: usize,

    /// Client start rate during ramp-up, in clients/second. <= 0 disables
    /// rate pacing (every slot becomes eligible immediately).
    #[arg(long = "ramp-rate", default_value_t = 5.0)]
    pub ramp_rate: f64,

    /// Maximum per-slot jitter applied during ramp-up, in seconds.
    #[arg(long = "ramp-jitter", default_value_t = 0.5)]
    pub ramp_jitter: f64,

    /// Stop after this many seconds in Steady state. Omit to run until
    /// signaled.
    #[arg(long)]
    pub duration: Option<f64>,

    /// Variant-selection policy: all, highest, lowest, or first.
    #[arg(long, default_value = "first")]
    pub variant: String,

    /// What to do when a required variant probe fails: fallback or fail.
    #[arg(long = "probe-failure-policy", default_value = "fallback")]
    pub probe_failure_policy: String,

    /// Override DNS resolution of the URL's host to this IP. Requires
    /// --dangerous (disables TLS certificate verification).
    #[arg(long)]
    pub resolve: Option<String>,

    /// Acknowledge the reduced security of --resolve.
    #[arg(long)]
    pub dangerous: bool,

    /// Send Cache-Control/Pragma: no-cache on every request.
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Extra request header in KEY:VALUE form. Repeatable.
    #[arg(long = "header")]
    pub header: Vec<String>,

    /// Bind address for the Prometheus metrics exposition endpoint.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub metrics: String,

    /// Expose one gauge per client id in addition to the aggregate series.
    #[arg(long = "per-client-metrics")]
    pub per_client_metrics: bool,

    /// Accept and parse, but this crate renders no dashboard itself; a
    /// consumer wired against ClientManager::snapshot() owns the TUI.
    #[arg(long)]
    pub tui: bool,

    /// Disable periodic stats log lines (the exposition endpoint and
    /// RunSummary are unaffected).
    #[arg(long = "no-stats")]
    pub no_stats: bool,

    /// Bounded line-queue capacity per worker pipeline.
    #[arg(long = "stats-buffer", default_value_t = 4096)]
    pub stats_buffer: usize,

    /// Drop-ratio threshold above which a client is reported as degraded.
    #[arg(long = "stats-drop-threshold", default_value_t = 0.01)]
    pub stats_drop_threshold: f64,

    /// Worker binary to invoke (bare name looked up on PATH, or a path).
    #[arg(long, default_value = "ffmpeg")]
    pub worker: String,

    /// Print the constructed worker command for client 0 and exit.
    #[arg(long = "print-cmd")]
    pub print_cmd: bool,

    /// Validate configuration and exit without starting any clients.
    #[arg(long)]
    pub check: bool,

    /// Skip the Preflight state's binary/fd-limit checks.
    #[arg(long = "skip-preflight")]
    pub skip_preflight: bool,

    /// Origin/CDN Prometheus-text exporter URL to scrape. Repeatable;
    /// omit to disable the Origin Exporter Scraper entirely.
    #[arg(long = "origin-exporter")]
    pub origin_exporter: Vec<String>,

    /// Origin segment directory listing URL (JSON array of {name, size})
    /// feeding the Segment Size Lookup cache. Omit to disable.
    #[arg(long = "segment-listing")]
    pub segment_listing: Option<String>,

    /// Seed for deterministic backoff/ramp jitter. Fixed by default so
    /// repeated runs against the same URL are directly comparable.
    #[arg(long = "config-seed", default_value_t = 0, hide = true)]
    pub config_seed: u64,

    /// Raise the log filter to debug for this crate (overridden by RUST_LOG).
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let args = Args::parse_from(["hls-loadgen", "https://example.com/master.m3u8"]);
        assert_eq!(args.url, "https://example.com/master.m3u8");
        assert_eq!(args.clients, 10);
        assert_eq!(args.worker, "ffmpeg");
        assert!(!args.dangerous);
    }

    #[test]
    fn repeatable_flags_accumulate() {
        let args = Args::parse_from([
            "hls-loadgen",
            "https://example.com/master.m3u8",
            "--header",
            "X-A: 1",
            "--header",
            "X-B: 2",
            "--origin-exporter",
            "http://a/metrics",
            "--origin-exporter",
            "http://b/metrics",
        ]);
        assert_eq!(args.header, vec!["X-A: 1".to_string(), "X-B: 2".to_string()]);
        assert_eq!(args.origin_exporter, vec!["http://a/metrics".to_string(), "http://b/metrics".to_string()]);
    }

    #[test]
    fn boolean_flags_default_false() {
        let args = Args::parse_from(["hls-loadgen", "https://example.com/master.m3u8"]);
        assert!(!args.tui);
        assert!(!args.no_stats);
        assert!(!args.check);
        assert!(!args.skip_preflight);
    }
}
