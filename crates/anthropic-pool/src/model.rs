//! Account data model
//!
//! `Account` mirrors the persistent shape of the accounts file exactly;
//! `access`/`expires` are carried in memory only and are rehydrated from the
//! host auth store (`anthropic_auth::CredentialStore`) at load time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Usage counters for one account. Grow-only except for an explicit reset,
/// which is why `last_reset` exists: it lets merge-on-save distinguish "add a
/// delta" from "a reset happened, take the absolute value" (see
/// [`crate::manager::AccountManager::save_to_disk`]).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub last_reset: u64,
}

impl Stats {
    pub fn add(&mut self, other: &Stats) {
        self.requests += other.requests;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }

    pub fn is_zero(&self) -> bool {
        self.requests == 0
            && self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_write_tokens == 0
    }
}

/// A single pooled OAuth credential and its persistent state.
///
/// `access`/`expires` are transient: they are never written to the accounts
/// file (see [`AccountStorage`]'s (de)serialization), living instead in the
/// host auth store. `#[serde(skip)]` with `Default` fills them in as empty on
/// load; [`crate::manager::AccountManager::load`] rehydrates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub refresh_token: String,
    pub added_at: u64,
    pub last_used: u64,
    pub enabled: bool,
    #[serde(default)]
    pub rate_limit_reset_times: HashMap<String, u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_failure_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_switch_reason: Option<String>,
    #[serde(default)]
    pub stats: Stats,

    #[serde(skip)]
    pub access: String,
    #[serde(skip)]
    pub expires: u64,
}

impl Account {
    /// Stable id per §3: `"<addedAt>:<first-12-chars-of-refreshToken>"`.
    pub fn make_id(added_at: u64, refresh_token: &str) -> String {
        let prefix: String = refresh_token.chars().take(12).collect();
        format!("{added_at}:{prefix}")
    }

    /// Whether this account's "anthropic" cooldown, if any, has passed.
    pub fn is_cooled_down(&self, now_ms: u64) -> bool {
        match self.rate_limit_reset_times.get("anthropic") {
            Some(&until) => until > now_ms,
            None => false,
        }
    }

    /// Lazily expire the "anthropic" cooldown entry if it has passed.
    pub fn expire_cooldown(&mut self, now_ms: u64) {
        if let Some(&until) = self.rate_limit_reset_times.get("anthropic")
            && until <= now_ms
        {
            self.rate_limit_reset_times.remove("anthropic");
        }
    }

    pub fn is_available(&self, now_ms: u64) -> bool {
        self.enabled && !self.is_cooled_down(now_ms)
    }
}

/// The on-disk document: `{version, accounts, activeIndex}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStorage {
    pub version: u32,
    pub accounts: Vec<Account>,
    pub active_index: usize,
}

impl AccountStorage {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn empty() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            accounts: Vec::new(),
            active_index: 0,
        }
    }

    /// Clamp `active_index` into range, per §3's invariant.
    pub fn clamp_active_index(&mut self) {
        if self.accounts.is_empty() {
            self.active_index = 0;
        } else if self.active_index >= self.accounts.len() {
            self.active_index = self.accounts.len() - 1;
        }
    }
}
