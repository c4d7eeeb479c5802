//! Account gateway
//!
//! Single-binary Rust service that fronts the Anthropic Messages API with a
//! pool of OAuth-authenticated accounts: it intercepts, authenticates, and
//! rewrites every request through `anthropic_pool::Interceptor`, rotating
//! accounts on rate limits and account-specific failures. Two HTTP listeners:
//! the public proxy (`/health`, `/metrics`, catch-all forward) and a
//! loopback-bound admin surface (account lifecycle, login/reauth, stats).
//! A `--cli <subcommand>` mode drives the same administrative operations
//! without a running server, for scripting and one-off maintenance.

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anthropic_auth::CredentialStore;
use anthropic_pool::{AccountManager, Interceptor, PoolConfig, Store};

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::ProxyState;

/// Shared state for the public-facing proxy router (`/health`, `/metrics`,
/// catch-all forward).
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    manager: Arc<AccountManager>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    started_at: Instant,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if let Some(cli_pos) = args.iter().position(|a| a == "--cli") {
        init_tracing();
        let subcommand = args.get(cli_pos + 1).cloned();
        let rest = args.get(cli_pos + 2..).map(|s| s.to_vec()).unwrap_or_default();
        let config_path = Config::resolve_path(cli_flag(&args, "--config"));
        let exit_code = run_cli(&config_path, subcommand.as_deref(), &rest).await;
        std::process::exit(exit_code);
    }

    init_tracing();
    info!("starting account-gateway");

    let config_path = Config::resolve_path(cli_flag(&args, "--config"));
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let pool_config = PoolConfig::load(&config.pool_config_path).await;

    info!(
        listen_addr = %config.listen_addr,
        admin_listen_addr = %config.admin_listen_addr,
        upstream_url = %config.upstream_url,
        strategy = ?pool_config.account_selection_strategy,
        "configuration loaded"
    );

    let manager = build_manager(&config, pool_config).await?;
    let metrics_handle = metrics::install_recorder();
    let http_client = reqwest::Client::new();
    let interceptor = Arc::new(Interceptor::new(manager.clone(), http_client.clone()));

    let proxy_state = ProxyState {
        interceptor,
        upstream_base: config.upstream_url.clone(),
        timeout: Duration::from_secs(config.timeout_secs),
    };
    let app_state = AppState {
        proxy: proxy_state,
        manager: manager.clone(),
        metrics_handle,
        started_at: Instant::now(),
    };

    let proxy_router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(app_state);

    let admin_state = AdminState::new(manager, http_client);
    let admin_router = admin::build_admin_router(admin_state);

    let proxy_listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    let admin_listener = TcpListener::bind(config.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.admin_listen_addr))?;

    info!(addr = %config.listen_addr, "proxy listening");
    info!(addr = %config.admin_listen_addr, "admin listening");

    let proxy_serve = axum::serve(proxy_listener, proxy_router).with_graceful_shutdown(shutdown_signal());
    let admin_serve = axum::serve(admin_listener, admin_router).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { proxy_serve.await.context("proxy server error") },
        async { admin_serve.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

async fn build_manager(config: &Config, pool_config: PoolConfig) -> Result<Arc<AccountManager>> {
    let store = Store::new(config.accounts_path.clone());
    let credentials = Arc::new(
        CredentialStore::load(config.credentials_path.clone())
            .await
            .context("failed to load credential store")?,
    );
    let notifier: anthropic_pool::SharedNotifier = Arc::new(anthropic_pool::NullNotifier);
    AccountManager::load(store, credentials, pool_config, notifier, None)
        .await
        .context("failed to load account pool")
}

fn cli_flag<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(|s| s.as_str())
}

/// Unix milliseconds, matching `anthropic_pool`'s internal clock convention
/// (that crate keeps its own `now_ms` private, so callers outside it need
/// their own copy).
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Health endpoint: pool-derived status, not just "the process is up".
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = now_ms();
    let accounts = state.manager.snapshot().await;
    let total = accounts.len();
    let available = accounts.iter().filter(|a| a.is_available(now)).count();
    let status = if total == 0 {
        "unhealthy"
    } else if available == 0 {
        "unhealthy"
    } else if available < total {
        "degraded"
    } else {
        "healthy"
    };
    let cooldowns: Vec<_> = accounts
        .iter()
        .filter(|a| a.is_cooled_down(now))
        .map(|a| serde_json::json!({ "id": a.id, "remaining_ms": a.rate_limit_reset_times.get("anthropic").map(|&t| t.saturating_sub(now)) }))
        .collect();

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "accounts_total": total,
        "accounts_available": available,
        "cooldowns": cooldowns,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}

/// Catch-all handler that forwards every non-`/health`/`/metrics` request
/// through the account interceptor.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

// ---------------------------------------------------------------------
// `--cli` dispatch (§6 administrative surface)
// ---------------------------------------------------------------------

/// Run one administrative subcommand against a freshly loaded pool and
/// return the process exit code (0 success, 1 any user-visible error).
async fn run_cli(config_path: &std::path::Path, subcommand: Option<&str>, rest: &[String]) -> i32 {
    let Some(subcommand) = subcommand else {
        eprintln!("usage: account-gateway --cli <list|status|switch|enable|disable|remove|reset|login|logout|reauth|refresh|stats|reset-stats|config> [args] [--force]");
        return 1;
    };

    let config = match Config::load(config_path).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to load config: {e}");
            return 1;
        }
    };
    let pool_config = PoolConfig::load(&config.pool_config_path).await;
    let manager = match build_manager(&config, pool_config).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {e:#}");
            return 1;
        }
    };
    let state = AdminState::new(manager.clone(), reqwest::Client::new());
    let force = rest.iter().any(|a| a == "--force");
    let index_arg = rest.iter().find(|a| *a != "--force").map(|s| s.as_str());

    let result = match subcommand {
        "list" => Ok(admin::op_list(&manager).await),
        "status" => Ok(admin::op_status(&manager).await),
        "stats" => Ok(admin::op_stats(&manager).await),
        "config" => Ok(admin::op_config(&manager)),
        "switch" => run_with_index(index_arg, |i| admin::op_switch(&manager, i)).await,
        "enable" => run_with_index(index_arg, |i| admin::op_toggle(&manager, i, true)).await,
        "disable" => run_with_index(index_arg, |i| admin::op_toggle(&manager, i, false)).await,
        "remove" => run_with_index(index_arg, |i| admin::op_remove(&manager, i, force, true)).await,
        "refresh" => run_with_index(index_arg, |i| admin::op_refresh(&state, i)).await,
        "reset" => match index_arg {
            Some("all") | None => admin::op_reset(&manager, None).await,
            Some(raw) => match raw.parse::<usize>() {
                Ok(i) => admin::op_reset(&manager, Some(i)).await,
                Err(_) => Err(error::Error::InvalidRequest(format!("not a valid index: {raw}"))),
            },
        },
        "reset-stats" => match index_arg {
            Some("all") | None => admin::op_reset_stats(&manager, None).await,
            Some(raw) => match raw.parse::<usize>() {
                Ok(i) => match manager.account_id_at(i).await {
                    Some(id) => admin::op_reset_stats(&manager, Some(id.as_str())).await,
                    None => Err(error::Error::Pool(anthropic_pool::Error::NotFound(format!("account index {i}")))),
                },
                Err(_) => Err(error::Error::InvalidRequest(format!("not a valid index: {raw}"))),
            },
        },
        "logout" => match index_arg {
            Some("--all") | Some("all") => admin::op_logout_all(&state, force, true).await,
            Some(raw) => match raw.parse::<usize>() {
                Ok(i) => admin::op_logout(&state, i, force, true).await,
                Err(_) => Err(error::Error::InvalidRequest(format!("not a valid index: {raw}"))),
            },
            None => Err(error::Error::InvalidRequest("logout requires an account index or --all".into())),
        },
        "login" => run_login(&state, rest).await,
        "reauth" => run_reauth(&state, index_arg).await,
        other => Err(error::Error::InvalidRequest(format!("unknown subcommand: {other}"))),
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

async fn run_with_index<F, Fut>(index_arg: Option<&str>, f: F) -> error::Result<serde_json::Value>
where
    F: FnOnce(usize) -> Fut,
    Fut: std::future::Future<Output = error::Result<serde_json::Value>>,
{
    let Some(raw) = index_arg else {
        return Err(error::Error::InvalidRequest("missing account index argument".into()));
    };
    let index: usize = raw
        .parse()
        .map_err(|_| error::Error::InvalidRequest(format!("not a valid index: {raw}")))?;
    f(index).await
}

/// Interactive OAuth login: print the authorization URL, read the callback
/// code from stdin (format `code#state`, matching the Claude CLI callback
/// page), and add the resulting account to the pool. Requires a TTY since
/// there is no other way to supply the code.
async fn run_login(state: &AdminState, rest: &[String]) -> error::Result<serde_json::Value> {
    if !std::io::stdin().is_terminal() {
        return Err(error::Error::TtyRequired);
    }
    let mode_arg = rest.iter().position(|a| a == "--mode").and_then(|i| rest.get(i + 1));
    let mode = match mode_arg.map(|s| s.as_str()) {
        Some("console") => anthropic_auth::AuthorizeMode::Console,
        _ => anthropic_auth::AuthorizeMode::Max,
    };

    let init = admin::op_login_init(state, mode, None).await;
    println!("Open this URL to authorize, then paste the callback code:\n{}", init["authorization_url"]);
    let code = read_line()?;
    admin::op_login_complete(state, code.trim()).await
}

/// Same flow as `login` but replaces an existing account's credential in
/// place instead of appending a new one.
async fn run_reauth(state: &AdminState, index_arg: Option<&str>) -> error::Result<serde_json::Value> {
    if !std::io::stdin().is_terminal() {
        return Err(error::Error::TtyRequired);
    }
    let Some(raw) = index_arg else {
        return Err(error::Error::InvalidRequest("reauth requires an account index".into()));
    };
    let index: usize = raw
        .parse()
        .map_err(|_| error::Error::InvalidRequest(format!("not a valid index: {raw}")))?;

    let init = admin::op_login_init(state, anthropic_auth::AuthorizeMode::Max, Some(index)).await;
    println!("Open this URL to re-authorize account {index}, then paste the callback code:\n{}", init["authorization_url"]);
    let code = read_line()?;
    admin::op_login_complete(state, code.trim()).await
}

fn read_line() -> error::Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| error::Error::UserVisible(format!("failed to read callback code: {e}")))?;
    Ok(line)
}
