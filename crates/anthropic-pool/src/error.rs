//! Error types for account pool operations

/// Errors from account pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No enabled Anthropic accounts available")]
    NoEnabledAccounts,

    #[error("No available Anthropic account for request")]
    AllSkipped,

    #[error("all accounts exhausted — no account could serve this request")]
    Exhausted,

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("cannot disable the only enabled account")]
    LastEnabledAccount,

    #[error("account pool already has the maximum of 10 accounts")]
    PoolFull,

    #[error("token refresh failed (status={status:?}, error_code={error_code:?}): {message}")]
    RefreshFailed {
        status: Option<u16>,
        error_code: Option<String>,
        message: String,
    },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("account-specific failure ({0:?}, status={1}) exhausted this account")]
    AccountFailure(crate::backoff::FailureReason, u16),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("oauth error: {0}")]
    OAuth(#[from] anthropic_auth::Error),
}

/// Result alias for account pool operations.
pub type Result<T> = std::result::Result<T, Error>;
