//! Administrative surface (§6)
//!
//! Exposes `list, status, switch N, enable N, disable N, remove N [--force],
//! reset N|all, login, logout N|--all [--force], reauth N, refresh N, stats,
//! reset-stats N|all, config` as a small set of operations against the same
//! `AccountManager` the proxy path drives. Both the admin HTTP
//! router (for programmatic callers) and `main.rs`'s `--cli` dispatch (for
//! the interactive terminal surface) call through these operations rather
//! than duplicating logic — the host CLI/slash-command surfaces named in §1
//! as out-of-scope collaborators are expected to do the same.
//!
//! Grounded on the teacher's `admin.rs` (axum router shape, `PkceState` with
//! a 600s expiry) for the OAuth-flow half; the non-OAuth operations
//! (switch/enable/disable/remove/reset/stats/config) are new, since the
//! teacher's `Pool` had no per-account lifecycle beyond add/remove.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use anthropic_auth::constants::AuthorizeMode;
use anthropic_pool::AccountManager;

use crate::error::{Error, Result};

/// In-memory PKCE state for an in-progress `login`/`reauth` flow. `reauth_index`
/// is `Some` when this flow will replace an existing account's credential in
/// place rather than append a new one.
struct PkceState {
    verifier: String,
    created_at: Instant,
    reauth_index: Option<usize>,
}

const PKCE_EXPIRY_SECS: u64 = 600;

#[derive(Clone)]
pub struct AdminState {
    manager: Arc<AccountManager>,
    http_client: reqwest::Client,
    pkce_states: Arc<Mutex<HashMap<String, PkceState>>>,
}

impl AdminState {
    pub fn new(manager: Arc<AccountManager>, http_client: reqwest::Client) -> Self {
        Self {
            manager,
            http_client,
            pkce_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(http_list))
        .route("/admin/status", get(http_status))
        .route("/admin/accounts/{idx}/switch", post(http_switch))
        .route("/admin/accounts/{idx}/enable", post(http_enable))
        .route("/admin/accounts/{idx}/disable", post(http_disable))
        .route("/admin/accounts/{idx}", delete(http_remove))
        .route("/admin/accounts/{idx}/reset", post(http_reset_one))
        .route("/admin/reset", post(http_reset_all))
        .route("/admin/login/init", post(http_login_init))
        .route("/admin/login/complete", post(http_login_complete))
        .route("/admin/accounts/{idx}/logout", post(http_logout_one))
        .route("/admin/logout", post(http_logout_all))
        .route("/admin/accounts/{idx}/reauth/init", post(http_reauth_init))
        .route("/admin/accounts/{idx}/refresh", post(http_refresh))
        .route("/admin/stats", get(http_stats))
        .route("/admin/stats/{idx}/reset", post(http_reset_stats_one))
        .route("/admin/stats/reset", post(http_reset_stats_all))
        .route("/admin/config", get(http_config))
        .with_state(state)
}

// ---------------------------------------------------------------------
// Operations. Pure of HTTP/CLI concerns beyond the `Result<Value>` they
// return; both transports format the same payload.
// ---------------------------------------------------------------------

fn account_summary(account: &anthropic_pool::Account, now: u64, is_active: bool) -> Value {
    let status = if !account.enabled {
        "disabled"
    } else if account.is_cooled_down(now) {
        "cooling_down"
    } else {
        "available"
    };
    json!({
        "id": account.id,
        "email": account.email,
        "enabled": account.enabled,
        "status": status,
        "active": is_active,
        "consecutive_failures": account.consecutive_failures,
        "last_switch_reason": account.last_switch_reason,
        "last_used": account.last_used,
        "stats": account.stats,
    })
}

pub async fn op_list(manager: &AccountManager) -> Value {
    let now = crate::now_ms();
    let active = manager.active_index().await;
    let accounts = manager.snapshot().await;
    let list: Vec<Value> = accounts
        .iter()
        .enumerate()
        .map(|(i, a)| account_summary(a, now, i == active))
        .collect();
    json!({ "accounts": list })
}

pub async fn op_status(manager: &AccountManager) -> Value {
    let now = crate::now_ms();
    let accounts = manager.snapshot().await;
    let total = accounts.len();
    let available = accounts.iter().filter(|a| a.is_available(now)).count();
    json!({
        "status": if available > 0 { "healthy" } else { "unhealthy" },
        "strategy": format!("{:?}", manager.strategy()),
        "accounts_total": total,
        "accounts_available": available,
        "active_index": manager.active_index().await,
    })
}

pub async fn op_switch(manager: &AccountManager, index: usize) -> Result<Value> {
    manager.set_active_index(index).await?;
    Ok(json!({ "active_index": index }))
}

pub async fn op_toggle(manager: &AccountManager, index: usize, enabled: bool) -> Result<Value> {
    manager.toggle_account(index, enabled).await?;
    Ok(json!({ "index": index, "enabled": enabled }))
}

pub async fn op_remove(manager: &AccountManager, index: usize, force: bool, interactive: bool) -> Result<Value> {
    if interactive && !force && !std::io::stdin().is_terminal() {
        return Err(Error::ForceRequired("remove"));
    }
    manager.remove_account(index).await?;
    Ok(json!({ "index": index, "status": "removed" }))
}

pub async fn op_reset(manager: &AccountManager, index: Option<usize>) -> Result<Value> {
    manager.reset_account(index).await?;
    Ok(json!({ "reset": index.map(|i| i.to_string()).unwrap_or_else(|| "all".into()) }))
}

pub async fn op_reset_stats(manager: &AccountManager, account_id: Option<&str>) -> Result<Value> {
    manager.reset_stats(account_id).await?;
    Ok(json!({ "reset_stats": account_id.unwrap_or("all") }))
}

pub async fn op_stats(manager: &AccountManager) -> Value {
    let accounts = manager.snapshot().await;
    let list: Vec<Value> = accounts
        .iter()
        .map(|a| json!({ "id": a.id, "email": a.email, "stats": a.stats }))
        .collect();
    json!({ "accounts": list })
}

pub fn op_config(manager: &AccountManager) -> Value {
    serde_json::to_value(manager.config()).unwrap_or_else(|_| json!({}))
}

/// Start a `login` (or `reauth`, when `reauth_index` is `Some`) PKCE flow:
/// generate the verifier/challenge, build the authorization URL, and stash
/// the verifier keyed by the PKCE `state` parameter for `complete` to consume.
pub async fn op_login_init(state: &AdminState, mode: AuthorizeMode, reauth_index: Option<usize>) -> Value {
    let mut pkce_states = state.pkce_states.lock().await;
    pkce_states.retain(|_, s| s.created_at.elapsed().as_secs() < PKCE_EXPIRY_SECS);

    let verifier = anthropic_auth::generate_verifier();
    let challenge = anthropic_auth::compute_challenge(&verifier);
    let auth_state = verifier.clone();
    let authorization_url = anthropic_auth::build_authorization_url(mode, &auth_state, &challenge);

    pkce_states.insert(
        auth_state.clone(),
        PkceState {
            verifier,
            created_at: Instant::now(),
            reauth_index,
        },
    );

    json!({ "authorization_url": authorization_url, "state": auth_state })
}

/// Complete a pending `login`/`reauth` flow: exchange the code (accepting
/// the Claude CLI callback's `code#state` shape), then either append a new
/// account or replace credentials in place for a `reauth`.
pub async fn op_login_complete(state: &AdminState, code_and_state: &str) -> Result<Value> {
    let (code, pkce_key) = match code_and_state.split_once('#') {
        Some((code, key)) => (code, key.to_string()),
        None => (code_and_state, code_and_state.to_string()),
    };

    let pkce = {
        let mut states = state.pkce_states.lock().await;
        states.remove(&pkce_key)
    }
    .ok_or_else(|| Error::UserVisible("no pending login flow for this state (expired or not initiated)".into()))?;

    if pkce.created_at.elapsed() > Duration::from_secs(PKCE_EXPIRY_SECS) {
        return Err(Error::UserVisible("login flow expired, re-run login".into()));
    }

    let token = anthropic_auth::exchange_code(&state.http_client, code, &pkce.verifier)
        .await
        .map_err(|e| Error::UserVisible(format!("token exchange failed: {e}")))?;
    let expires = crate::now_ms() + token.expires_in * 1000;
    let email = token.email();

    let account = match pkce.reauth_index {
        Some(index) => {
            state
                .manager
                .reauth_account(index, token.refresh_token, token.access_token, expires, email)
                .await?
        }
        None => {
            state
                .manager
                .add_account(token.refresh_token, token.access_token, expires, email)
                .await?
        }
    };

    Ok(json!({ "id": account.id, "email": account.email, "status": "added" }))
}

pub async fn op_logout(state: &AdminState, index: usize, force: bool, interactive: bool) -> Result<Value> {
    if interactive && !force && !std::io::stdin().is_terminal() {
        return Err(Error::ForceRequired("logout"));
    }
    let Some(account) = state.manager.snapshot().await.into_iter().nth(index) else {
        return Err(Error::Pool(anthropic_pool::Error::NotFound(format!("account index {index}"))));
    };
    let _ = anthropic_auth::revoke(&state.http_client, &account.refresh_token).await;
    state.manager.remove_account(index).await?;
    Ok(json!({ "index": index, "status": "logged_out" }))
}

pub async fn op_logout_all(state: &AdminState, force: bool, interactive: bool) -> Result<Value> {
    if interactive && !force && !std::io::stdin().is_terminal() {
        return Err(Error::ForceRequired("logout"));
    }
    let accounts = state.manager.snapshot().await;
    for account in &accounts {
        let _ = anthropic_auth::revoke(&state.http_client, &account.refresh_token).await;
    }
    state.manager.clear_all().await;
    state.manager.save_to_disk().await?;
    Ok(json!({ "status": "logged_out", "count": accounts.len() }))
}

/// Force an immediate token refresh for the account at `index`. Uses the
/// same `refresh_token_detailed` + `apply_refreshed_token` pair the
/// interceptor's own single-flight path drives (see `interceptor.rs`'s
/// `do_refresh`); an explicit admin-triggered refresh has no request to
/// coalesce with, so it skips the `watch`-channel plumbing and calls
/// straight through.
pub async fn op_refresh(state: &AdminState, index: usize) -> Result<Value> {
    let account_id = state
        .manager
        .account_id_at(index)
        .await
        .ok_or_else(|| Error::Pool(anthropic_pool::Error::NotFound(format!("account index {index}"))))?;
    let account = state
        .manager
        .get_account(&account_id)
        .await
        .ok_or_else(|| Error::Pool(anthropic_pool::Error::NotFound(account_id.clone())))?;

    let response = anthropic_auth::refresh_token_detailed(&state.http_client, &account.refresh_token)
        .await
        .map_err(|e| Error::UserVisible(format!("refresh failed: {}", e.message)))?;
    let expires = crate::now_ms() + response.expires_in * 1000;
    state
        .manager
        .apply_refreshed_token(&account_id, response.access_token.clone(), Some(response.refresh_token), expires)
        .await?;
    Ok(json!({
        "index": index,
        "id": account_id,
        "refreshed": true,
        "access_token_prefix": response.access_token.chars().take(8).collect::<String>(),
    }))
}

// ---------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------

fn ok_json(value: Value) -> impl IntoResponse {
    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "application/json")], value.to_string())
}

fn err_response(e: Error) -> impl IntoResponse {
    let status = match &e {
        Error::Pool(anthropic_pool::Error::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Pool(anthropic_pool::Error::LastEnabledAccount) => StatusCode::CONFLICT,
        Error::ForceRequired(_) | Error::TtyRequired => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, [(axum::http::header::CONTENT_TYPE, "application/json")], json!({ "error": e.to_string() }).to_string())
}

async fn http_list(State(state): State<AdminState>) -> impl IntoResponse {
    ok_json(op_list(&state.manager).await).into_response()
}

async fn http_status(State(state): State<AdminState>) -> impl IntoResponse {
    ok_json(op_status(&state.manager).await).into_response()
}

async fn http_switch(State(state): State<AdminState>, Path(idx): Path<usize>) -> impl IntoResponse {
    match op_switch(&state.manager, idx).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_enable(State(state): State<AdminState>, Path(idx): Path<usize>) -> impl IntoResponse {
    match op_toggle(&state.manager, idx, true).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_disable(State(state): State<AdminState>, Path(idx): Path<usize>) -> impl IntoResponse {
    match op_toggle(&state.manager, idx, false).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct ForceQuery {
    #[serde(default)]
    force: bool,
}

async fn http_remove(
    State(state): State<AdminState>,
    Path(idx): Path<usize>,
    Query(q): Query<ForceQuery>,
) -> impl IntoResponse {
    // HTTP callers are not a TTY; `force` is the only gate over this transport.
    match op_remove(&state.manager, idx, q.force, false).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_reset_one(State(state): State<AdminState>, Path(idx): Path<usize>) -> impl IntoResponse {
    match op_reset(&state.manager, Some(idx)).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_reset_all(State(state): State<AdminState>) -> impl IntoResponse {
    match op_reset(&state.manager, None).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct LoginInitRequest {
    #[serde(default)]
    mode: Option<String>,
}

fn parse_mode(raw: Option<&str>) -> AuthorizeMode {
    match raw {
        Some("console") => AuthorizeMode::Console,
        _ => AuthorizeMode::Max,
    }
}

async fn http_login_init(State(state): State<AdminState>, axum::Json(body): axum::Json<LoginInitRequest>) -> impl IntoResponse {
    let mode = parse_mode(body.mode.as_deref());
    ok_json(op_login_init(&state, mode, None).await).into_response()
}

#[derive(Deserialize)]
struct LoginCompleteRequest {
    code: String,
}

async fn http_login_complete(State(state): State<AdminState>, axum::Json(body): axum::Json<LoginCompleteRequest>) -> impl IntoResponse {
    match op_login_complete(&state, &body.code).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_reauth_init(
    State(state): State<AdminState>,
    Path(idx): Path<usize>,
    axum::Json(body): axum::Json<LoginInitRequest>,
) -> impl IntoResponse {
    let mode = parse_mode(body.mode.as_deref());
    ok_json(op_login_init(&state, mode, Some(idx)).await).into_response()
}

async fn http_logout_one(
    State(state): State<AdminState>,
    Path(idx): Path<usize>,
    Query(q): Query<ForceQuery>,
) -> impl IntoResponse {
    match op_logout(&state, idx, q.force, false).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_logout_all(State(state): State<AdminState>, Query(q): Query<ForceQuery>) -> impl IntoResponse {
    match op_logout_all(&state, q.force, false).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_refresh(State(state): State<AdminState>, Path(idx): Path<usize>) -> impl IntoResponse {
    match op_refresh(&state, idx).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_stats(State(state): State<AdminState>) -> impl IntoResponse {
    ok_json(op_stats(&state.manager).await).into_response()
}

async fn http_reset_stats_one(State(state): State<AdminState>, Path(idx): Path<usize>) -> impl IntoResponse {
    let Some(account_id) = state.manager.account_id_at(idx).await else {
        return err_response(Error::Pool(anthropic_pool::Error::NotFound(format!("account index {idx}")))).into_response();
    };
    match op_reset_stats(&state.manager, Some(account_id.as_str())).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_reset_stats_all(State(state): State<AdminState>) -> impl IntoResponse {
    match op_reset_stats(&state.manager, None).await {
        Ok(v) => ok_json(v).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn http_config(State(state): State<AdminState>) -> impl IntoResponse {
    ok_json(op_config(&state.manager)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use anthropic_pool::{PoolConfig, Store};
    use anthropic_auth::CredentialStore;
    use tower::ServiceExt;

    async fn test_state(dir: &std::path::Path) -> AdminState {
        let store = Store::new(dir.join("accounts.json"));
        let credentials = Arc::new(CredentialStore::load(dir.join("credentials.json")).await.unwrap());
        let manager = AccountManager::load(
            store,
            credentials,
            PoolConfig::default(),
            Arc::new(anthropic_pool::NullNotifier),
            None,
        )
        .await
        .unwrap();
        AdminState::new(manager, reqwest::Client::new())
    }

    #[tokio::test]
    async fn list_accounts_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accounts"], json!([]));
    }

    #[tokio::test]
    async fn switch_enable_disable_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        state.manager.add_account("rt-2".into(), "at-2".into(), 0, None).await.unwrap();
        let app = build_admin_router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/admin/accounts/1/switch").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.manager.active_index().await, 1);

        let response = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/admin/accounts/0/disable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.manager.snapshot().await[0].enabled);

        let response = app
            .oneshot(Request::builder().method("POST").uri("/admin/accounts/0/enable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.manager.snapshot().await[0].enabled);
    }

    #[tokio::test]
    async fn disabling_last_enabled_account_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().method("POST").uri("/admin/accounts/0/disable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn remove_without_force_over_http_succeeds_since_http_is_not_a_tty() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        let app = build_admin_router(state.clone());

        let response = app
            .oneshot(Request::builder().method("DELETE").uri("/admin/accounts/0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.manager.snapshot().await.len(), 0);
    }

    #[tokio::test]
    async fn login_init_then_complete_rejects_unknown_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let init = op_login_init(&state, AuthorizeMode::Max, None).await;
        assert!(init["authorization_url"].as_str().unwrap().starts_with("https://claude.ai/oauth/authorize"));

        let result = op_login_complete(&state, "some-code#unknown-state").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reset_stats_zeroes_one_account() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let account = state.manager.add_account("rt-1".into(), "at-1".into(), 0, None).await.unwrap();
        state.manager.record_usage(&account.id, 10, 0, 0, 0).await;
        let app = build_admin_router(state.clone());

        let response = app
            .oneshot(Request::builder().method("POST").uri("/admin/stats/0/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.manager.snapshot().await[0].stats.is_zero());
    }

    #[tokio::test]
    async fn config_endpoint_reports_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["account_selection_strategy"], "sticky");
    }
}
