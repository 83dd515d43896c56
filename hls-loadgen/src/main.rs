//! `hls-loadgen`: drives many concurrent HLS viewers against an origin or
//! CDN by orchestrating FFmpeg worker subprocesses, one per simulated
//! viewer. See each module for the component it implements.

use std::process::ExitCode;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::error;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use hls_loadgen::cli::Args;
use hls_loadgen::logging;
use hls_loadgen::orchestrator::Orchestrator;

fn main() -> ExitCode {
    let args = Args::parse();
    let verbose = args.verbose;
    let _log_guard = logging::init(verbose);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(Orchestrator::new(config).run()) {
        Ok(summary) => {
            print!("{summary}");
            ExitCode::from(0)
        }
        Err(e) => {
            error!(error = %e, "run failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
