//! Pool configuration
//!
//! Loaded from a TOML file (the host application's existing config format;
//! see `DESIGN.md` for why this diverges from the documented JSON shape)
//! with environment variable overrides and range clamping. Grounded on the
//! teacher's `services/oauth-proxy/src/config.rs` `Config::load` skeleton,
//! generalized from a single `todo!()` stub into the full defaulting,
//! env-override, and clamping pipeline this component needs.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bucket::TokenBucketConfig;
use crate::health::HealthScoreConfig;
use crate::selector::Strategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToastConfig {
    pub quiet: bool,
    pub debounce_seconds: u32,
}

impl Default for ToastConfig {
    fn default() -> Self {
        Self {
            quiet: false,
            debounce_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub account_selection_strategy: Strategy,
    pub max_rate_limit_wait_seconds: u32,
    pub failure_ttl_seconds: u64,
    pub debug: bool,
    pub toasts: ToastConfig,
    pub health_score: HealthScoreConfig,
    pub token_bucket: TokenBucketConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            account_selection_strategy: Strategy::Sticky,
            max_rate_limit_wait_seconds: 300,
            failure_ttl_seconds: 3600,
            debug: false,
            toasts: ToastConfig::default(),
            health_score: HealthScoreConfig::default(),
            token_bucket: TokenBucketConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Load from `path` if present, then apply `OPENCODE_ANTHROPIC_*`
    /// environment overrides, then clamp numeric fields to their declared
    /// ranges. Invalid or missing values fall back to defaults rather than
    /// failing the load — a malformed config must never prevent startup.
    pub async fn load(path: &Path) -> Self {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "invalid pool config, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config.clamp();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("OPENCODE_ANTHROPIC_STRATEGY") {
            match raw.as_str() {
                "sticky" => self.account_selection_strategy = Strategy::Sticky,
                "round-robin" => self.account_selection_strategy = Strategy::RoundRobin,
                "hybrid" => self.account_selection_strategy = Strategy::Hybrid,
                _ => {}
            }
        }

        if let Ok(raw) = env::var("OPENCODE_ANTHROPIC_DEBUG")
            && let Some(value) = parse_bool_flag(&raw)
        {
            self.debug = value;
        }

        if let Ok(raw) = env::var("OPENCODE_ANTHROPIC_QUIET")
            && let Some(value) = parse_bool_flag(&raw)
        {
            self.toasts.quiet = value;
        }
    }

    fn clamp(&mut self) {
        let defaults = Self::default();

        self.toasts.debounce_seconds = self.toasts.debounce_seconds.clamp(0, 300);

        if !(0.0..=100.0).contains(&self.health_score.initial) {
            self.health_score.initial = defaults.health_score.initial;
        }
        self.health_score.rate_limit_penalty = self.health_score.rate_limit_penalty.clamp(-50.0, 0.0);
        self.health_score.failure_penalty = self.health_score.failure_penalty.clamp(-50.0, 0.0);
    }
}

/// Parse `"1"`, `"true"` as true and `"0"`, `"false"` as false (case
/// insensitive); anything else is ignored so the existing value stands.
fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}
