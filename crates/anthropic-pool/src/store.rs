//! Durable account file storage
//!
//! Pure I/O over a single JSON document (§4.1). Writes are atomic (temp file
//! + rename); malformed or partial files are treated as absent rather than a
//! fatal error, so a corrupt write can never brick the pool. Grounded on
//! `anthropic_auth::credentials::write_atomic`'s temp-file-plus-rename idiom,
//! generalized from a flat credential map to the full `AccountStorage`
//! document and the defaulting/dedup/clamp rules this component adds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Account, AccountStorage};

/// Loads and saves the accounts file at a fixed path.
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the accounts file. Returns `(document, existed)`; `existed` is
    /// false for a missing, unparseable, or schema-invalid file — callers
    /// treat that the same as a fresh empty pool.
    pub async fn load(&self) -> (AccountStorage, bool) {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(_) => return (AccountStorage::empty(), false),
        };

        let raw: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "accounts file is not valid JSON, treating as absent");
                return (AccountStorage::empty(), false);
            }
        };

        let version = raw.get("version").and_then(|v| v.as_u64());
        if version != Some(AccountStorage::CURRENT_VERSION as u64) {
            warn!(path = %self.path.display(), "accounts file has unexpected version, treating as absent");
            return (AccountStorage::empty(), false);
        }

        let Some(raw_accounts) = raw.get("accounts").and_then(|v| v.as_array()) else {
            warn!(path = %self.path.display(), "accounts field is not an array, treating as absent");
            return (AccountStorage::empty(), false);
        };

        let mut accounts: Vec<Account> = Vec::new();
        let mut seen_refresh_tokens: HashSet<String> = HashSet::new();

        for raw_account in raw_accounts {
            let Ok(mut account) = serde_json::from_value::<Account>(raw_account.clone()) else {
                continue;
            };
            if account.refresh_token.is_empty() {
                continue;
            }

            if seen_refresh_tokens.contains(&account.refresh_token) {
                // Keep whichever duplicate has the larger last_used.
                if let Some(existing) = accounts
                    .iter_mut()
                    .find(|a| a.refresh_token == account.refresh_token)
                    && account.last_used > existing.last_used
                {
                    *existing = account;
                }
                continue;
            }
            seen_refresh_tokens.insert(account.refresh_token.clone());

            if account.id.is_empty() {
                account.id = Account::make_id(account.added_at, &account.refresh_token);
            }
            accounts.push(account);
        }

        let active_index = raw
            .get("activeIndex")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        let mut doc = AccountStorage {
            version: AccountStorage::CURRENT_VERSION,
            accounts,
            active_index,
        };
        doc.clamp_active_index();

        debug!(path = %self.path.display(), accounts = doc.accounts.len(), "loaded accounts file");
        (doc, true)
    }

    /// Persist the document atomically: ensure the parent directory exists,
    /// write to a randomly-named temp file with mode 0600, then rename over
    /// the target. The temp file is unlinked (best effort) on any error.
    pub async fn save(&self, doc: &AccountStorage) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Store(format!("creating config directory: {e}")))?;
            self.ensure_gitignore(dir).await;
        }

        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::Store(format!("serializing accounts file: {e}")))?;

        let suffix: String = {
            let bytes: [u8; 6] = rand_bytes();
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        };
        let tmp_path = self
            .path
            .with_extension(format!("{suffix}.tmp"));

        let write_result = tokio::fs::write(&tmp_path, json.as_bytes()).await;
        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Store(format!("writing temp accounts file: {e}")));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = tokio::fs::set_permissions(&tmp_path, perms).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(Error::Store(format!("setting accounts file permissions: {e}")));
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Store(format!("renaming accounts file into place: {e}")));
        }

        debug!(path = %self.path.display(), "saved accounts file");
        Ok(())
    }

    /// Delete the accounts file. Absence is not an error.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "cleared accounts file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!("deleting accounts file: {e}"))),
        }
    }

    /// Add the accounts file and its `.tmp` shadows to a sibling `.gitignore`,
    /// creating the file if absent. Idempotent: never appends a duplicate line.
    async fn ensure_gitignore(&self, dir: &Path) {
        let Some(file_name) = self.path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let gitignore_path = dir.join(".gitignore");
        let pattern = format!("{file_name}*");

        let existing = tokio::fs::read_to_string(&gitignore_path)
            .await
            .unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return;
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&pattern);
        updated.push('\n');

        if let Err(e) = tokio::fs::write(&gitignore_path, updated).await {
            warn!(path = %gitignore_path.display(), error = %e, "failed to update .gitignore");
        }
    }
}

fn rand_bytes() -> [u8; 6] {
    use rand::RngExt;
    let mut bytes = [0u8; 6];
    rand::rng().fill(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stats;
    use std::collections::HashMap;

    fn test_account(refresh_token: &str, last_used: u64) -> Account {
        Account {
            id: String::new(),
            email: None,
            refresh_token: refresh_token.into(),
            added_at: 1_700_000_000_000,
            last_used,
            enabled: true,
            rate_limit_reset_times: HashMap::new(),
            consecutive_failures: 0,
            last_failure_time: None,
            last_switch_reason: None,
            stats: Stats::default(),
            access: String::new(),
            expires: 0,
        }
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty_not_existed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        let (doc, existed) = store.load().await;
        assert!(!existed);
        assert!(doc.accounts.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        let mut doc = AccountStorage::empty();
        doc.accounts.push(test_account("rt-1", 0));
        doc.accounts[0].id = Account::make_id(doc.accounts[0].added_at, "rt-1");

        store.save(&doc).await.unwrap();
        let (loaded, existed) = store.load().await;
        assert!(existed);
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].refresh_token, "rt-1");
    }

    #[tokio::test]
    async fn load_malformed_json_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = Store::new(path);
        let (doc, existed) = store.load().await;
        assert!(!existed);
        assert!(doc.accounts.is_empty());
    }

    #[tokio::test]
    async fn load_wrong_version_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        tokio::fs::write(&path, br#"{"version":99,"accounts":[],"activeIndex":0}"#)
            .await
            .unwrap();
        let store = Store::new(path);
        let (_doc, existed) = store.load().await;
        assert!(!existed);
    }

    #[tokio::test]
    async fn load_deduplicates_by_refresh_token_keeping_latest_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        let mut doc = AccountStorage::empty();
        let mut older = test_account("dup", 10);
        older.id = "a".into();
        let mut newer = test_account("dup", 20);
        newer.id = "b".into();
        doc.accounts = vec![older, newer];

        store.save(&doc).await.unwrap();
        let (loaded, _) = store.load().await;
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].last_used, 20);
    }

    #[tokio::test]
    async fn load_skips_entries_without_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        tokio::fs::write(
            &path,
            br#"{"version":1,"accounts":[{"id":"x","refreshToken":"","addedAt":0,"lastUsed":0,"enabled":true,"stats":{}}],"activeIndex":0}"#,
        )
        .await
        .unwrap();
        let store = Store::new(path);
        let (doc, existed) = store.load().await;
        assert!(existed);
        assert!(doc.accounts.is_empty());
    }

    #[tokio::test]
    async fn save_creates_gitignore_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        store.save(&AccountStorage::empty()).await.unwrap();

        let gitignore = tokio::fs::read_to_string(dir.path().join(".gitignore"))
            .await
            .unwrap();
        assert!(gitignore.contains("accounts.json*"));
    }

    #[tokio::test]
    async fn save_gitignore_entry_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        store.save(&AccountStorage::empty()).await.unwrap();
        store.save(&AccountStorage::empty()).await.unwrap();

        let gitignore = tokio::fs::read_to_string(dir.path().join(".gitignore"))
            .await
            .unwrap();
        assert_eq!(gitignore.matches("accounts.json*").count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_sets_0600_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = Store::new(path.clone());
        store.save(&AccountStorage::empty()).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn clear_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn clear_removes_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("accounts.json"));
        store.save(&AccountStorage::empty()).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.path().exists());
    }
}
