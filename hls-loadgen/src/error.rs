//! Crate-wide error taxonomy.
//!
//! Only configuration, preflight, and exposition failures are meant to
//! surface to `main` as fatal. Everything else (worker exits, pipe errors,
//! scrape failures) is recovered locally and never constructed here.

use thiserror::Error;

/// Top-level error type returned by the orchestrator to `main`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("failed to bind metrics exposition on {addr}: {source}")]
    Exposition {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("graceful shutdown did not complete within the deadline")]
    IncompleteShutdown,
}

impl CoreError {
    /// Map to the process exit code documented in the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Config(_) => 2,
            CoreError::Preflight(_) => 3,
            CoreError::Exposition { .. } => 1,
            CoreError::IncompleteShutdown => 1,
        }
    }
}

/// Errors raised while translating CLI args into a validated `Config`.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("unknown variant policy {0:?}, expected all|highest|lowest|first")]
    UnknownVariant(String),

    #[error("unknown probe failure policy {0:?}, expected fallback|fail")]
    UnknownProbePolicy(String),

    #[error("--resolve was given without --dangerous; refusing to disable TLS verification")]
    ResolveWithoutDangerous,

    #[error("worker binary {0:?} not found or not executable")]
    WorkerBinaryMissing(String),

    #[error("a variant/program-id selection is required but was not set")]
    ProgramIdRequired,

    #[error("invalid header {0:?}, expected KEY:VALUE")]
    InvalidHeader(String),

    #[error("--clients must be greater than zero")]
    ZeroClients,

    #[error("invalid metrics bind address {0:?}: {1}")]
    InvalidMetricsAddr(String, String),
}
