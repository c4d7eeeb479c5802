//! Configuration types and loading
//!
//! Gateway-level settings (listen addresses, upstream URL, storage paths) live
//! here; account-pool settings (`account_selection_strategy`, health score,
//! token bucket, toasts) are parsed straight out of the same file by
//! `anthropic_pool::PoolConfig::load` — each crate owns the slice of the
//! config shape it's responsible for.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Root configuration for the gateway binary.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub upstream_url: String,
    pub accounts_path: PathBuf,
    pub credentials_path: PathBuf,
    pub pool_config_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8787".parse().expect("valid default listen_addr"),
            admin_listen_addr: "127.0.0.1:9090".parse().expect("valid default admin_listen_addr"),
            upstream_url: "https://api.anthropic.com".to_string(),
            accounts_path: PathBuf::from("accounts.json"),
            credentials_path: PathBuf::from("credentials.json"),
            pool_config_path: PathBuf::from("account-gateway.toml"),
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// Resolve the config file path: `--config` flag, then
    /// `ACCOUNT_GATEWAY_CONFIG` env var, then the default filename in the
    /// current directory.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(path) = cli_path {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ACCOUNT_GATEWAY_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("account-gateway.toml")
    }

    /// Load configuration from `path`. A missing file falls back to defaults
    /// rather than failing startup; a present-but-malformed file is an error
    /// (unlike `PoolConfig::load`, which is best-effort) since gateway
    /// settings like `listen_addr` have no safe default to fall back to
    /// silently.
    pub async fn load(path: &Path) -> common::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => toml::from_str(&contents).map_err(common::Error::Toml),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 8787);
        assert_eq!(config.admin_listen_addr.port(), 9090);
        assert_eq!(config.upstream_url, "https://api.anthropic.com");
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let config = Config::load(Path::new("/nonexistent/account-gateway.toml"))
            .await
            .unwrap();
        assert_eq!(config.listen_addr.port(), 8787);
    }

    #[tokio::test]
    async fn load_parses_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account-gateway.toml");
        tokio::fs::write(
            &path,
            br#"listen_addr = "0.0.0.0:9000"
upstream_url = "https://api.anthropic.com"
"#,
        )
        .await
        .unwrap();
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
    }

    #[tokio::test]
    async fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account-gateway.toml");
        tokio::fs::write(&path, b"not valid toml {{{").await.unwrap();
        assert!(Config::load(&path).await.is_err());
    }

    #[test]
    fn resolve_path_prefers_cli_flag() {
        assert_eq!(Config::resolve_path(Some("/tmp/custom.toml")), PathBuf::from("/tmp/custom.toml"));
    }
}
