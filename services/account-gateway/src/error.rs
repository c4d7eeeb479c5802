//! Service-specific error types

use thiserror::Error;

/// Gateway errors, spanning both the HTTP server and the `--cli`
/// administrative dispatch mode.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind listener: {0}")]
    ListenerBind(String),

    #[error("Upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("account pool error: {0}")]
    Pool(#[from] anthropic_pool::Error),

    #[error("{0}")]
    UserVisible(String),

    #[error("this operation requires a terminal (run interactively, or pass --force)")]
    TtyRequired,

    #[error("refusing to {0} without --force in a non-interactive session")]
    ForceRequired(&'static str),
}

impl Error {
    /// Process exit code for `--cli` dispatch (§6: 0 success, 1 any
    /// user-visible error).
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, Error>;
