//! Token bucket tracking
//!
//! A per-account rate limiter that regenerates continuously with time,
//! independent of whether the account was selected in between reads. Unlike
//! [`crate::health::HealthScore`]'s hourly-floored recovery, regeneration
//! here is continuous — matching the documented read-time formula exactly.

use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: u64 = 60_000;

/// Tunables for a token bucket, loaded from the `token_bucket` section of
/// the pool config. Defaults match the documented fallback `{50, 6, 50}` for
/// `{max_tokens, regeneration_rate_per_minute, initial_tokens}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketConfig {
    pub max_tokens: f64,
    pub regeneration_rate_per_minute: f64,
    pub initial_tokens: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50.0,
            regeneration_rate_per_minute: 6.0,
            initial_tokens: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    pub last_updated: u64,
}

impl TokenBucket {
    pub fn new(config: &TokenBucketConfig) -> Self {
        Self {
            tokens: config.initial_tokens,
            last_updated: 0,
        }
    }

    /// Apply continuous regeneration up to `now_ms`.
    pub fn regenerate(&mut self, now_ms: u64, config: &TokenBucketConfig) {
        if now_ms <= self.last_updated {
            return;
        }
        let elapsed_minutes = (now_ms - self.last_updated) as f64 / MS_PER_MINUTE as f64;
        self.tokens =
            (self.tokens + elapsed_minutes * config.regeneration_rate_per_minute).min(config.max_tokens);
        self.last_updated = now_ms;
    }

    /// Current token count as of `now_ms`, with regeneration applied but not stored.
    pub fn current_tokens(&self, now_ms: u64, config: &TokenBucketConfig) -> f64 {
        let mut snapshot = *self;
        snapshot.regenerate(now_ms, config);
        snapshot.tokens
    }

    /// Whether at least one token is available as of `now_ms`.
    pub fn has_tokens(&self, now_ms: u64, config: &TokenBucketConfig) -> bool {
        self.current_tokens(now_ms, config) >= 1.0
    }

    /// Consume one token, regenerating first. No-op (still returns `false`)
    /// if the bucket is empty — callers must check availability via the
    /// backoff/selector path before a request is attempted, this only
    /// guards against a double-spend race.
    pub fn try_consume(&mut self, now_ms: u64, config: &TokenBucketConfig) -> bool {
        self.regenerate(now_ms, config);
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_configured_initial_tokens() {
        let config = TokenBucketConfig::default();
        let bucket = TokenBucket::new(&config);
        assert_eq!(bucket.tokens, 50.0);
    }

    #[test]
    fn regenerates_continuously() {
        let config = TokenBucketConfig::default();
        let mut bucket = TokenBucket::new(&config);
        bucket.tokens = 0.0;
        bucket.last_updated = 0;
        bucket.regenerate(10 * MS_PER_MINUTE, &config);
        assert_eq!(bucket.tokens, 60.0_f64.min(config.max_tokens));
    }

    #[test]
    fn regeneration_caps_at_max_tokens() {
        let config = TokenBucketConfig::default();
        let mut bucket = TokenBucket::new(&config);
        bucket.regenerate(1_000 * MS_PER_MINUTE, &config);
        assert_eq!(bucket.tokens, 50.0);
    }

    #[test]
    fn try_consume_decrements_by_one() {
        let config = TokenBucketConfig::default();
        let mut bucket = TokenBucket::new(&config);
        assert!(bucket.try_consume(0, &config));
        assert_eq!(bucket.tokens, 49.0);
    }

    #[test]
    fn try_consume_fails_when_empty() {
        let config = TokenBucketConfig::default();
        let mut bucket = TokenBucket::new(&config);
        bucket.tokens = 0.0;
        assert!(!bucket.try_consume(0, &config));
    }

    #[test]
    fn has_tokens_accounts_for_pending_regeneration() {
        let config = TokenBucketConfig::default();
        let mut bucket = TokenBucket::new(&config);
        bucket.tokens = 0.0;
        bucket.last_updated = 0;
        assert!(!bucket.has_tokens(0, &config));
        assert!(bucket.has_tokens(MS_PER_MINUTE, &config));
    }

    #[test]
    fn regenerate_does_not_rewind_on_stale_timestamp() {
        let config = TokenBucketConfig::default();
        let mut bucket = TokenBucket::new(&config);
        bucket.last_updated = 1_000;
        bucket.tokens = 10.0;
        bucket.regenerate(500, &config);
        assert_eq!(bucket.tokens, 10.0);
    }
}
