//! Tracing setup: stderr-only so stdout stays free for `--print-cmd` output
//! and the final `RunSummary`. Filter defaults to this crate at info (debug
//! under `--verbose`), overridable wholesale via `RUST_LOG`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "hls_loadgen=info";
const VERBOSE_LOG_FILTER: &str = "hls_loadgen=debug";

/// Install the global tracing subscriber. The returned `WorkerGuard` must
/// be held for the process lifetime; dropping it early truncates buffered
/// log output.
pub fn init(verbose: bool) -> WorkerGuard {
    let default_filter = if verbose { VERBOSE_LOG_FILTER } else { DEFAULT_LOG_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .init();
    guard
}
