//! Subscription pool for Anthropic OAuth accounts
//!
//! Manages multiple Claude subscription accounts behind a single inference
//! endpoint: health-scored, token-bucket-limited account selection
//! ([`selector`]), durable storage with merge-on-save counters ([`store`],
//! [`model`]), tiered backoff classification ([`backoff`]), and a request
//! interceptor ([`interceptor`]) that ties account selection, single-flight
//! token refresh, and response classification into one retry loop.
//!
//! Account lifecycle:
//! 1. Admin adds an account → credential persisted via `anthropic_auth::CredentialStore`.
//! 2. The interceptor selects an account per [`selector::select`], refreshing
//!    its token if expired.
//! 3. A response is classified as service-wide or account-specific
//!    ([`backoff::classify`]); account-specific failures cool the account
//!    down for a reason-tiered duration and the loop retries another account.
//! 4. Auth failures exhaust the account's consecutive-failure budget and it
//!    is disabled permanently; health and rate-limit state recover over time.

pub mod backoff;
pub mod bucket;
pub mod config;
pub mod error;
pub mod health;
pub mod interceptor;
pub mod manager;
pub mod model;
pub mod notifier;
pub mod selector;
pub mod store;

pub use backoff::{Classification, FailureReason, classify, parse_retry_after};
pub use bucket::{TokenBucket, TokenBucketConfig};
pub use config::{PoolConfig, ToastConfig};
pub use error::{Error, Result};
pub use health::{HealthScore, HealthScoreConfig};
pub use interceptor::{InterceptedResponse, Interceptor, OutboundRequest, ResponseBody};
pub use manager::{AccountManager, AuthFallback};
pub use model::{Account, AccountStorage, Stats};
pub use notifier::{Notifier, NullNotifier, SharedNotifier, ToastKey, ToastLevel};
pub use selector::Strategy;
pub use store::Store;

/// Shared wall-clock helper: unix milliseconds, used throughout the crate
/// for expiry/cooldown/backoff arithmetic.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
