//! Account manager
//!
//! Owns the in-memory pool of accounts and the per-account health/bucket
//! trackers; composes [`crate::selector`] over them; schedules debounced
//! persistence through [`crate::store::Store`]. Grounded structurally on
//! `CredentialStore`'s single-mutex-over-state idiom (`anthropic-auth`'s
//! `credentials.rs`), generalized from a flat credential map into the full
//! account lifecycle this component owns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use anthropic_auth::{Credential, CredentialStore};

use crate::backoff::{self, FailureReason};
use crate::bucket::TokenBucket;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::health::HealthScore;
use crate::model::{Account, AccountStorage, Stats};
use crate::notifier::{Notifier, SharedNotifier, ToastLevel};
use crate::now_ms;
use crate::selector::{self, Candidate, Strategy};
use crate::store::Store;

const MAX_ACCOUNTS: usize = 10;
const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// A credential just obtained from an OAuth exchange, used to bootstrap an
/// empty pool at [`AccountManager::load`] time.
pub struct AuthFallback {
    pub refresh_token: String,
    pub access_token: String,
    pub expires: u64,
    pub email: Option<String>,
}

struct Inner {
    accounts: Vec<Account>,
    active_index: usize,
    health: HashMap<String, HealthScore>,
    buckets: HashMap<String, TokenBucket>,
    cursor: usize,
    stats_deltas: HashMap<String, Stats>,
    stats_reset: HashSet<String>,
}

impl Inner {
    fn find(&self, account_id: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.id == account_id)
    }

    fn health_for(&mut self, account_id: &str, config: &PoolConfig) -> &mut HealthScore {
        self.health
            .entry(account_id.to_string())
            .or_insert_with(|| HealthScore::new(&config.health_score))
    }

    fn bucket_for(&mut self, account_id: &str, config: &PoolConfig) -> &mut TokenBucket {
        self.buckets
            .entry(account_id.to_string())
            .or_insert_with(|| TokenBucket::new(&config.token_bucket))
    }
}

pub struct AccountManager {
    store: Store,
    credentials: Arc<CredentialStore>,
    notifier: SharedNotifier,
    config: PoolConfig,
    inner: Mutex<Inner>,
    save_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AccountManager {
    /// Load the pool from disk, bootstrapping from `auth_fallback` if the
    /// pool is empty, or rehydrating a matching entry's transient
    /// access/expires if it matches an existing refresh token.
    pub async fn load(
        store: Store,
        credentials: Arc<CredentialStore>,
        config: PoolConfig,
        notifier: SharedNotifier,
        auth_fallback: Option<AuthFallback>,
    ) -> Result<Arc<Self>> {
        let (mut doc, existed) = store.load().await;

        if let Some(fallback) = auth_fallback {
            if doc.accounts.is_empty() {
                let now = now_ms();
                let mut account = Account {
                    id: String::new(),
                    email: fallback.email,
                    refresh_token: fallback.refresh_token,
                    added_at: now,
                    last_used: 0,
                    enabled: true,
                    rate_limit_reset_times: HashMap::new(),
                    consecutive_failures: 0,
                    last_failure_time: None,
                    last_switch_reason: None,
                    stats: Stats::default(),
                    access: fallback.access_token,
                    expires: fallback.expires,
                };
                account.id = Account::make_id(account.added_at, &account.refresh_token);
                doc.accounts.push(account);
                doc.active_index = 0;
            } else if let Some(existing) = doc
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == fallback.refresh_token)
            {
                existing.access = fallback.access_token;
                existing.expires = fallback.expires;
            }
        }

        for account in &mut doc.accounts {
            if let Some(credential) = credentials.get(&account.id).await {
                account.access = credential.access;
                account.expires = credential.expires;
            }
        }

        doc.clamp_active_index();

        let manager = Arc::new(Self {
            store,
            credentials,
            notifier,
            config,
            inner: Mutex::new(Inner {
                accounts: doc.accounts,
                active_index: doc.active_index,
                health: HashMap::new(),
                buckets: HashMap::new(),
                cursor: 0,
                stats_deltas: HashMap::new(),
                stats_reset: HashSet::new(),
            }),
            save_task: Mutex::new(None),
        });

        if !existed {
            manager.save_to_disk().await?;
        }

        Ok(manager)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Select and return the current account, skipping anything in `skip`.
    /// Updates `last_used`, consumes one bucket token, and remembers the
    /// selected index as the new active account.
    pub async fn get_current_account(&self, skip: &HashSet<String>) -> Option<Account> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;

        for account in &mut inner.accounts {
            account.expire_cooldown(now);
        }

        let candidate_pool_indices: Vec<usize> = inner
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_available(now) && !skip.contains(&a.id))
            .map(|(i, _)| i)
            .collect();

        if candidate_pool_indices.is_empty() {
            return None;
        }

        let strategy = self.config.account_selection_strategy;
        let health_config = self.config.health_score;
        let bucket_config = self.config.token_bucket;

        let candidates: Vec<Candidate> = candidate_pool_indices
            .iter()
            .map(|&pool_index| {
                let id = inner.accounts[pool_index].id.clone();
                let health = *inner.health.entry(id.clone()).or_insert_with(|| HealthScore::new(&health_config));
                let bucket = *inner.buckets.entry(id).or_insert_with(|| TokenBucket::new(&bucket_config));
                Candidate {
                    pool_index,
                    health,
                    bucket,
                    last_used: inner.accounts[pool_index].last_used,
                }
            })
            .collect();

        let current_pool_index = if inner.active_index < inner.accounts.len() {
            Some(inner.active_index)
        } else {
            None
        };

        let selection = selector::select(
            &candidates,
            strategy,
            current_pool_index,
            inner.cursor,
            now,
            &health_config,
            &bucket_config,
        )?;

        inner.cursor = selection.new_cursor;
        let chosen_pool_index = candidates[selection.candidate_slot].pool_index;
        inner.active_index = chosen_pool_index;

        let account_id = inner.accounts[chosen_pool_index].id.clone();
        inner.bucket_for(&account_id, &self.config).try_consume(now, &bucket_config);
        inner.accounts[chosen_pool_index].last_used = now;

        Some(inner.accounts[chosen_pool_index].clone())
    }

    /// Record an account-specific rate-limit/quota/auth failure. Returns the
    /// computed cooldown duration in ms.
    pub async fn mark_rate_limited(
        &self,
        account_id: &str,
        reason: FailureReason,
        retry_after_ms: Option<u64>,
    ) -> Option<u64> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        let index = inner.find(account_id)?;

        let ttl_ms = self.config.failure_ttl_seconds * 1000;
        if let Some(last_failure) = inner.accounts[index].last_failure_time
            && now.saturating_sub(last_failure) > ttl_ms
        {
            inner.accounts[index].consecutive_failures = 0;
        }
        inner.accounts[index].consecutive_failures += 1;
        inner.accounts[index].last_failure_time = Some(now);

        let cooldown = backoff::cooldown_ms(reason, inner.accounts[index].consecutive_failures.saturating_sub(1), retry_after_ms);
        inner
            .accounts[index]
            .rate_limit_reset_times
            .insert("anthropic".into(), now + cooldown);
        inner.accounts[index].last_switch_reason = Some(reason.as_str().to_string());

        inner.health_for(account_id, &self.config).record_rate_limit(now, &self.config.health_score);

        drop(inner);
        metrics::counter!("account_cooldowns_total", "reason" => reason.as_str()).increment(1);
        self.request_save_to_disk_inner().await;
        Some(cooldown)
    }

    pub async fn mark_success(&self, account_id: &str) {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        if let Some(index) = inner.find(account_id) {
            inner.accounts[index].consecutive_failures = 0;
            inner.accounts[index].last_failure_time = None;
        }
        inner.health_for(account_id, &self.config).record_success(now, &self.config.health_score);
    }

    /// Record a network/transport failure: health penalty, refund the
    /// bucket token since the request never reached upstream.
    pub async fn mark_failure(&self, account_id: &str) {
        let now = now_ms();
        let bucket_config = self.config.token_bucket;
        let mut inner = self.inner.lock().await;
        inner.health_for(account_id, &self.config).record_failure(now, &self.config.health_score);
        let bucket = inner.bucket_for(account_id, &self.config);
        bucket.regenerate(now, &bucket_config);
        bucket.tokens = (bucket.tokens + 1.0).min(bucket_config.max_tokens);
    }

    /// Add a new account, or update an existing entry sharing the same
    /// refresh token in place (re-enabling it, preserving counters).
    pub async fn add_account(
        &self,
        refresh_token: String,
        access_token: String,
        expires: u64,
        email: Option<String>,
    ) -> Result<Account> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner
            .accounts
            .iter_mut()
            .find(|a| a.refresh_token == refresh_token)
        {
            existing.access = access_token;
            existing.expires = expires;
            existing.enabled = true;
            if email.is_some() {
                existing.email = email;
            }
            let account = existing.clone();
            drop(inner);
            self.persist_credential(&account, &refresh_token).await?;
            self.save_to_disk().await?;
            return Ok(account);
        }

        if inner.accounts.len() >= MAX_ACCOUNTS {
            return Err(Error::PoolFull);
        }

        let was_empty = inner.accounts.is_empty();
        let mut account = Account {
            id: String::new(),
            email,
            refresh_token: refresh_token.clone(),
            added_at: now,
            last_used: 0,
            enabled: true,
            rate_limit_reset_times: HashMap::new(),
            consecutive_failures: 0,
            last_failure_time: None,
            last_switch_reason: None,
            stats: Stats::default(),
            access: access_token,
            expires,
        };
        account.id = Account::make_id(account.added_at, &account.refresh_token);
        inner.accounts.push(account.clone());
        if was_empty {
            inner.active_index = 0;
        }

        drop(inner);
        self.persist_credential(&account, &refresh_token).await?;
        self.save_to_disk().await?;
        Ok(account)
    }

    async fn persist_credential(&self, account: &Account, refresh_token: &str) -> Result<()> {
        self.credentials
            .add(
                account.id.clone(),
                Credential {
                    credential_type: "oauth".into(),
                    refresh: refresh_token.to_string(),
                    access: account.access.clone(),
                    expires: account.expires,
                },
            )
            .await
            .map_err(Error::OAuth)
    }

    pub async fn remove_account(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if index >= inner.accounts.len() {
            return Err(Error::NotFound(format!("account index {index}")));
        }
        let account = inner.accounts.remove(index);
        inner.health.remove(&account.id);
        inner.buckets.remove(&account.id);
        let mut storage = AccountStorage {
            version: AccountStorage::CURRENT_VERSION,
            accounts: inner.accounts.clone(),
            active_index: inner.active_index,
        };
        storage.clamp_active_index();
        inner.active_index = storage.active_index;
        drop(inner);

        let _ = self.credentials.remove(&account.id).await;
        self.store.save(&storage).await
    }

    /// Enable/disable the account at `index`. Rejects disabling the sole
    /// enabled account.
    pub async fn toggle_account(&self, index: usize, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if index >= inner.accounts.len() {
            return Err(Error::NotFound(format!("account index {index}")));
        }

        if !enabled {
            let enabled_count = inner.accounts.iter().filter(|a| a.enabled).count();
            if enabled_count <= 1 && inner.accounts[index].enabled {
                return Err(Error::LastEnabledAccount);
            }
        }

        inner.accounts[index].enabled = enabled;
        let storage = AccountStorage {
            version: AccountStorage::CURRENT_VERSION,
            accounts: inner.accounts.clone(),
            active_index: inner.active_index,
        };
        drop(inner);
        self.store.save(&storage).await
    }

    /// Clear the in-memory pool only; does not touch disk (§4.4).
    pub async fn clear_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.accounts.clear();
        inner.active_index = 0;
        inner.health.clear();
        inner.buckets.clear();
        inner.stats_deltas.clear();
        inner.stats_reset.clear();
    }

    /// Accumulate a usage delta for merge-on-save and bump the request counter.
    pub async fn record_usage(&self, account_id: &str, input: u64, output: u64, cache_read: u64, cache_write: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(index) = inner.find(account_id) {
            inner.accounts[index].stats.requests += 1;
            inner.accounts[index].stats.input_tokens += input;
            inner.accounts[index].stats.output_tokens += output;
            inner.accounts[index].stats.cache_read_tokens += cache_read;
            inner.accounts[index].stats.cache_write_tokens += cache_write;
        }
        let delta = inner
            .stats_deltas
            .entry(account_id.to_string())
            .or_default();
        delta.requests += 1;
        delta.input_tokens += input;
        delta.output_tokens += output;
        delta.cache_read_tokens += cache_read;
        delta.cache_write_tokens += cache_write;
    }

    /// Reset stats for one account id, or every account when `target` is `None`.
    pub async fn reset_stats(&self, target: Option<&str>) -> Result<()> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;
        match target {
            Some(account_id) => {
                let index = inner
                    .find(account_id)
                    .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
                inner.accounts[index].stats = Stats {
                    last_reset: now,
                    ..Default::default()
                };
                inner.stats_deltas.remove(account_id);
                inner.stats_reset.insert(account_id.to_string());
            }
            None => {
                let ids: Vec<String> = inner.accounts.iter().map(|a| a.id.clone()).collect();
                for account in &mut inner.accounts {
                    account.stats = Stats {
                        last_reset: now,
                        ..Default::default()
                    };
                }
                inner.stats_deltas.clear();
                inner.stats_reset.extend(ids);
            }
        }
        drop(inner);
        self.save_to_disk().await
    }

    /// Re-read the store and reconcile: drop accounts gone from disk, add
    /// new ones, copy `enabled` state and `activeIndex` when the disk
    /// target is itself enabled. Lets sibling CLI processes steer selection
    /// without a restart.
    pub async fn sync_active_index_from_disk(&self) {
        let (doc, existed) = self.store.load().await;
        if !existed {
            return;
        }

        let mut inner = self.inner.lock().await;
        let disk_ids: HashSet<&str> = doc.accounts.iter().map(|a| a.id.as_str()).collect();
        inner.accounts.retain(|a| disk_ids.contains(a.id.as_str()));

        for disk_account in &doc.accounts {
            match inner.find(&disk_account.id) {
                Some(index) => {
                    inner.accounts[index].enabled = disk_account.enabled;
                }
                None => {
                    inner.accounts.push(disk_account.clone());
                }
            }
        }

        if let Some(target) = doc.accounts.get(doc.active_index)
            && target.enabled
            && let Some(index) = inner.find(&target.id)
        {
            inner.active_index = index;
        }
        inner.clamp_active_index();
    }

    /// Schedule a debounced save roughly `SAVE_DEBOUNCE` from now, coalescing
    /// bursts of state changes. Requires `Arc<Self>` since the spawned task
    /// needs to outlive the caller's stack frame.
    pub async fn request_save_to_disk(self: &Arc<Self>) {
        let mut task_slot = self.save_task.lock().await;
        if let Some(existing) = task_slot.take() {
            existing.abort();
        }
        let manager = Arc::clone(self);
        *task_slot = Some(tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            if let Err(e) = manager.save_to_disk().await {
                warn!(error = %e, "debounced save failed");
            }
        }));
    }

    /// Internal debounce helper for methods that don't hold `Arc<Self>`.
    /// Falls back to an immediate save since there is no `Arc` to spawn
    /// against.
    async fn request_save_to_disk_inner(&self) {
        if let Err(e) = self.save_to_disk().await {
            warn!(error = %e, "save failed");
        }
    }

    /// Merge-on-save: re-read disk, and for each account matched by id,
    /// write `diskStats + localDelta` (or the absolute local value if a
    /// reset happened since the last save), preserving `lastReset` from
    /// disk unless this account was itself reset.
    pub async fn save_to_disk(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let (disk_doc, disk_existed) = self.store.load().await;
        let disk_by_id: HashMap<String, Stats> = if disk_existed {
            disk_doc
                .accounts
                .iter()
                .map(|a| (a.id.clone(), a.stats))
                .collect()
        } else {
            HashMap::new()
        };

        let mut merged_accounts = inner.accounts.clone();
        for account in &mut merged_accounts {
            if inner.stats_reset.contains(&account.id) {
                continue;
            }
            let Some(delta) = inner.stats_deltas.get(&account.id) else {
                continue;
            };
            match disk_by_id.get(&account.id) {
                Some(disk_stats) => {
                    let mut merged = *disk_stats;
                    merged.add(delta);
                    account.stats = merged;
                }
                None => {
                    // No disk baseline (first save): local absolute value stands.
                }
            }
        }

        let storage = AccountStorage {
            version: AccountStorage::CURRENT_VERSION,
            accounts: merged_accounts.clone(),
            active_index: inner.active_index,
        };

        let result = self.store.save(&storage).await;
        if result.is_ok() {
            inner.accounts = merged_accounts;
            inner.stats_deltas.clear();
            inner.stats_reset.clear();
        }
        result
    }

    /// Refresh the access token for `account_id`, update both the pool's
    /// in-memory copy and the host credential store. Callers are expected
    /// to have already gone through the single-flight coalescer in
    /// [`crate::interceptor`].
    pub async fn apply_refreshed_token(
        &self,
        account_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .find(account_id)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        inner.accounts[index].access = access_token.clone();
        inner.accounts[index].expires = expires;
        if let Some(new_refresh) = &refresh_token {
            inner.accounts[index].refresh_token = new_refresh.clone();
        }
        let final_refresh = inner.accounts[index].refresh_token.clone();
        drop(inner);

        self.credentials
            .update_token(account_id, access_token, final_refresh, expires)
            .await
            .map_err(Error::OAuth)?;
        self.request_save_to_disk_inner().await;
        Ok(())
    }

    /// Re-authenticate the account at `index` in place: replace its refresh
    /// token, access token, and expiry (and email, if supplied) with a fresh
    /// OAuth grant, re-enabling it and clearing its failure/cooldown state.
    /// Used by the administrative `reauth N` operation to recover an account
    /// that a terminal refresh failure disabled, without disturbing its
    /// position, stats, or id.
    pub async fn reauth_account(
        &self,
        index: usize,
        refresh_token: String,
        access_token: String,
        expires: u64,
        email: Option<String>,
    ) -> Result<Account> {
        let mut inner = self.inner.lock().await;
        if index >= inner.accounts.len() {
            return Err(Error::NotFound(format!("account index {index}")));
        }
        inner.accounts[index].refresh_token = refresh_token.clone();
        inner.accounts[index].access = access_token;
        inner.accounts[index].expires = expires;
        inner.accounts[index].enabled = true;
        inner.accounts[index].consecutive_failures = 0;
        inner.accounts[index].last_failure_time = None;
        inner.accounts[index].rate_limit_reset_times.clear();
        inner.accounts[index].last_switch_reason = None;
        if email.is_some() {
            inner.accounts[index].email = email;
        }
        let account = inner.accounts[index].clone();
        drop(inner);

        self.persist_credential(&account, &refresh_token).await?;
        self.save_to_disk().await?;
        Ok(account)
    }

    /// Permanently disable an account after a terminal refresh failure,
    /// persisting immediately and emitting an error toast.
    pub async fn disable_permanently(&self, account_id: &str, reason: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(index) = inner.find(account_id) {
                inner.accounts[index].enabled = false;
                inner.accounts[index].last_switch_reason = Some(reason.to_string());
            }
        }
        self.save_to_disk().await?;
        metrics::counter!("account_disabled_total").increment(1);
        self.notifier.notify(
            ToastLevel::Error,
            None,
            &format!("account {account_id} disabled: {reason}"),
        );
        Ok(())
    }

    /// Clear an account's cached access token and expiry so the next use
    /// refreshes. Called on `AUTH_FAILED` before the cooldown is applied.
    pub async fn clear_access_token(&self, account_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(index) = inner.find(account_id) {
            inner.accounts[index].access.clear();
            inner.accounts[index].expires = 0;
        }
    }

    pub async fn get_account(&self, account_id: &str) -> Option<Account> {
        let inner = self.inner.lock().await;
        inner.accounts.iter().find(|a| a.id == account_id).cloned()
    }

    pub async fn account_id_at(&self, index: usize) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.accounts.get(index).map(|a| a.id.clone())
    }

    /// Manually select the active account by index, bypassing the
    /// selector's scoring entirely. Used by the administrative `switch`
    /// operation.
    pub async fn set_active_index(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if index >= inner.accounts.len() {
            return Err(Error::NotFound(format!("account index {index}")));
        }
        inner.active_index = index;
        let storage = AccountStorage {
            version: AccountStorage::CURRENT_VERSION,
            accounts: inner.accounts.clone(),
            active_index: inner.active_index,
        };
        drop(inner);
        self.store.save(&storage).await
    }

    /// Clear failure/cooldown state for one account, or every account when
    /// `index` is `None`. Distinct from [`Self::reset_stats`], which only
    /// touches usage counters — this is the administrative `reset`
    /// operation, used to manually clear a stuck cooldown.
    pub async fn reset_account(&self, index: Option<usize>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match index {
            Some(i) => {
                if i >= inner.accounts.len() {
                    return Err(Error::NotFound(format!("account index {i}")));
                }
                inner.accounts[i].consecutive_failures = 0;
                inner.accounts[i].last_failure_time = None;
                inner.accounts[i].rate_limit_reset_times.clear();
                inner.accounts[i].last_switch_reason = None;
            }
            None => {
                for account in &mut inner.accounts {
                    account.consecutive_failures = 0;
                    account.last_failure_time = None;
                    account.rate_limit_reset_times.clear();
                    account.last_switch_reason = None;
                }
            }
        }
        let storage = AccountStorage {
            version: AccountStorage::CURRENT_VERSION,
            accounts: inner.accounts.clone(),
            active_index: inner.active_index,
        };
        drop(inner);
        self.store.save(&storage).await
    }

    pub fn notifier(&self) -> &SharedNotifier {
        &self.notifier
    }

    pub async fn snapshot(&self) -> Vec<Account> {
        self.inner.lock().await.accounts.clone()
    }

    pub async fn active_index(&self) -> usize {
        self.inner.lock().await.active_index
    }

    pub fn strategy(&self) -> Strategy {
        self.config.account_selection_strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_manager() -> Arc<AccountManager> {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        let credentials = Arc::new(
            CredentialStore::load(dir.path().join("credentials.json"))
                .await
                .unwrap(),
        );
        AccountManager::load(
            store,
            credentials,
            PoolConfig::default(),
            Arc::new(crate::notifier::NullNotifier),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn add_account_bootstraps_empty_pool() {
        let manager = test_manager().await;
        let account = manager
            .add_account("rt-1".into(), "at-1".into(), 0, None)
            .await
            .unwrap();
        assert_eq!(manager.active_index().await, 0);
        assert_eq!(manager.snapshot().await.len(), 1);
        assert_eq!(account.refresh_token, "rt-1");
    }

    #[tokio::test]
    async fn add_account_with_duplicate_refresh_token_updates_in_place() {
        let manager = test_manager().await;
        manager
            .add_account("rt-1".into(), "at-1".into(), 0, None)
            .await
            .unwrap();
        manager.toggle_account(0, false).await.ok();
        manager
            .add_account("rt-1".into(), "at-2".into(), 100, Some("a@b.com".into()))
            .await
            .unwrap();
        let accounts = manager.snapshot().await;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].access, "at-2");
        assert!(accounts[0].enabled);
    }

    #[tokio::test]
    async fn add_account_rejects_beyond_ten() {
        let manager = test_manager().await;
        for i in 0..10 {
            manager
                .add_account(format!("rt-{i}"), format!("at-{i}"), 0, None)
                .await
                .unwrap();
        }
        let result = manager.add_account("rt-11".into(), "at-11".into(), 0, None).await;
        assert!(matches!(result, Err(Error::PoolFull)));
    }

    #[tokio::test]
    async fn get_current_account_skips_disabled() {
        let manager = test_manager().await;
        manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager.add_account("rt-2".into(), "at-2".into(), 0, None).await.unwrap();
        manager.toggle_account(0, false).await.unwrap();

        let account = manager.get_current_account(&HashSet::new()).await.unwrap();
        assert_eq!(account.refresh_token, "rt-2");
    }

    #[tokio::test]
    async fn toggle_account_rejects_disabling_last_enabled() {
        let manager = test_manager().await;
        manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        let result = manager.toggle_account(0, false).await;
        assert!(matches!(result, Err(Error::LastEnabledAccount)));
    }

    #[tokio::test]
    async fn mark_rate_limited_sets_cooldown_and_increments_failures() {
        let manager = test_manager().await;
        let account = manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        let cooldown = manager
            .mark_rate_limited(&account.id, FailureReason::RateLimitExceeded, None)
            .await
            .unwrap();
        assert_eq!(cooldown, 30_000);
        let accounts = manager.snapshot().await;
        assert_eq!(accounts[0].consecutive_failures, 1);
        assert!(accounts[0].rate_limit_reset_times.contains_key("anthropic"));
    }

    #[tokio::test]
    async fn mark_success_clears_failure_state() {
        let manager = test_manager().await;
        let account = manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager
            .mark_rate_limited(&account.id, FailureReason::RateLimitExceeded, None)
            .await;
        manager.mark_success(&account.id).await;
        let accounts = manager.snapshot().await;
        assert_eq!(accounts[0].consecutive_failures, 0);
        assert!(accounts[0].last_failure_time.is_none());
    }

    #[tokio::test]
    async fn remove_account_clamps_active_index() {
        let manager = test_manager().await;
        manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager.add_account("rt-2".into(), "at-2".into(), 0, None).await.unwrap();
        manager.remove_account(1).await.unwrap();
        assert_eq!(manager.active_index().await, 0);
        assert_eq!(manager.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn record_usage_accumulates_stats() {
        let manager = test_manager().await;
        let account = manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager.record_usage(&account.id, 10, 20, 0, 0).await;
        manager.record_usage(&account.id, 5, 5, 0, 0).await;
        let accounts = manager.snapshot().await;
        assert_eq!(accounts[0].stats.requests, 2);
        assert_eq!(accounts[0].stats.input_tokens, 15);
        assert_eq!(accounts[0].stats.output_tokens, 25);
    }

    #[tokio::test]
    async fn save_to_disk_merges_concurrent_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        let credentials = Arc::new(
            CredentialStore::load(dir.path().join("credentials.json")).await.unwrap(),
        );

        let manager_a = AccountManager::load(
            Store::new(dir.path().join("accounts.json")),
            credentials.clone(),
            PoolConfig::default(),
            Arc::new(crate::notifier::NullNotifier),
            None,
        )
        .await
        .unwrap();
        let account = manager_a.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();

        let manager_b = AccountManager::load(
            store,
            credentials,
            PoolConfig::default(),
            Arc::new(crate::notifier::NullNotifier),
            None,
        )
        .await
        .unwrap();

        manager_a.record_usage(&account.id, 0, 0, 0, 0).await;
        manager_a.record_usage(&account.id, 0, 0, 0, 0).await;
        manager_a.record_usage(&account.id, 0, 0, 0, 0).await;
        manager_b.record_usage(&account.id, 0, 0, 0, 0).await;
        manager_b.record_usage(&account.id, 0, 0, 0, 0).await;

        manager_a.save_to_disk().await.unwrap();
        manager_b.save_to_disk().await.unwrap();

        let (doc, _) = Store::new(dir.path().join("accounts.json")).load().await;
        assert_eq!(doc.accounts[0].stats.requests, 5);
    }

    #[tokio::test]
    async fn reset_stats_overrides_delta_path() {
        let manager = test_manager().await;
        let account = manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager.record_usage(&account.id, 10, 0, 0, 0).await;
        manager.reset_stats(Some(&account.id)).await.unwrap();
        let accounts = manager.snapshot().await;
        assert!(accounts[0].stats.is_zero());
    }

    #[tokio::test]
    async fn set_active_index_switches_selection_target() {
        let manager = test_manager().await;
        manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager.add_account("rt-2".into(), "at-2".into(), 0, None).await.unwrap();
        manager.set_active_index(1).await.unwrap();
        assert_eq!(manager.active_index().await, 1);
    }

    #[tokio::test]
    async fn set_active_index_rejects_out_of_range() {
        let manager = test_manager().await;
        manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        assert!(matches!(manager.set_active_index(5).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn reset_account_clears_cooldown_and_failures() {
        let manager = test_manager().await;
        let account = manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager
            .mark_rate_limited(&account.id, FailureReason::RateLimitExceeded, None)
            .await;
        manager.reset_account(Some(0)).await.unwrap();
        let accounts = manager.snapshot().await;
        assert_eq!(accounts[0].consecutive_failures, 0);
        assert!(accounts[0].rate_limit_reset_times.is_empty());
    }

    #[tokio::test]
    async fn reauth_account_replaces_token_and_reenables() {
        let manager = test_manager().await;
        manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        manager.toggle_account(0, false).await.ok();
        manager
            .mark_rate_limited(&manager.snapshot().await[0].id.clone(), FailureReason::AuthFailed, None)
            .await;

        let account = manager
            .reauth_account(0, "rt-2".into(), "at-2".into(), 123, Some("a@b.com".into()))
            .await
            .unwrap();

        assert_eq!(account.refresh_token, "rt-2");
        assert_eq!(account.access, "at-2");
        assert!(account.enabled);
        assert_eq!(account.consecutive_failures, 0);
        assert!(account.rate_limit_reset_times.is_empty());
        assert_eq!(account.email, Some("a@b.com".to_string()));
    }

    #[tokio::test]
    async fn reset_account_all_clears_every_account() {
        let manager = test_manager().await;
        let a = manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        let b = manager.add_account("rt-2".into(), "at-2".into(), 0, None).await.unwrap();
        manager.mark_rate_limited(&a.id, FailureReason::RateLimitExceeded, None).await;
        manager.mark_rate_limited(&b.id, FailureReason::RateLimitExceeded, None).await;
        manager.reset_account(None).await.unwrap();
        let accounts = manager.snapshot().await;
        assert!(accounts.iter().all(|a| a.rate_limit_reset_times.is_empty()));
    }
}
