//! Request interceptor
//!
//! Drives one outbound request through the full account lifecycle (§4.5):
//! sync the pool against disk, rewrite the request once, then loop over
//! account selection/token-refresh/forward/classify until a response can be
//! returned or every account has been tried. Grounded structurally on
//! `provider_impl.rs`'s prepare-request-then-classify pipeline (header
//! injection, beta-flag merge) for the rewrite half, and on
//! `pool.rs::select`'s inline-refresh-on-expiry for the single-flight idea —
//! rewritten against a `tokio::sync::watch` coalescer per §5's single-flight
//! requirement, since the teacher let concurrent callers each refresh the
//! same account.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::backoff::{self, Classification, FailureReason};
use crate::error::{Error, Result};
use crate::manager::AccountManager;
use crate::model::{Account, Stats};
use crate::notifier::ToastLevel;

/// Required `anthropic-beta` flags, always injected and merged with any
/// client-provided flags (§4.5 step 2).
const REQUIRED_BETAS: &[&str] = &["oauth-2025-04-20", "interleaved-thinking-2025-05-14"];

const USER_AGENT: &str = "claude-cli/2.1.2 (external, cli)";

/// A request about to go upstream, already shaped by the caller (method,
/// target URL, headers, optional JSON body) but not yet carrying
/// account-specific auth.
pub struct OutboundRequest {
    pub method: reqwest::Method,
    pub url: reqwest::Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// A response body that may be a single buffered chunk or a scanned SSE
/// passthrough stream.
pub type ResponseBody = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

pub struct InterceptedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

#[derive(Clone)]
struct RefreshedToken {
    access_token: String,
    expires: u64,
}

#[derive(Clone)]
struct RefreshFailure {
    status: Option<u16>,
    error_code: Option<String>,
    message: String,
}

type RefreshOutcome = std::result::Result<RefreshedToken, RefreshFailure>;

/// Wraps the host HTTP client, coalesces concurrent token refreshes per
/// account id, and drives the rewrite/retry/classify loop in §4.5.
pub struct Interceptor {
    manager: Arc<AccountManager>,
    client: reqwest::Client,
    refresh_inflight: Mutex<HashMap<String, watch::Receiver<Option<RefreshOutcome>>>>,
    toasted_accounts: Mutex<HashSet<String>>,
    last_switch_toast: Mutex<Option<Instant>>,
}

impl Interceptor {
    pub fn new(manager: Arc<AccountManager>, client: reqwest::Client) -> Self {
        Self {
            manager,
            client,
            refresh_inflight: Mutex::new(HashMap::new()),
            toasted_accounts: Mutex::new(HashSet::new()),
            last_switch_toast: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<AccountManager> {
        &self.manager
    }

    /// Drive one logical request: sync, rewrite, then retry across accounts
    /// until a response is returnable or the pool is exhausted.
    pub async fn forward(&self, mut request: OutboundRequest) -> Result<InterceptedResponse> {
        self.manager.sync_active_index_from_disk().await;

        rewrite_url(&mut request.url);
        strip_and_merge_headers(&mut request.headers);
        let is_messages_post =
            request.method == reqwest::Method::POST && request.url.path() == "/v1/messages";

        let rewritten_body = rewrite_body(request.body.as_deref());

        let total_accounts = self.manager.snapshot().await.len().max(1);
        let mut skip: HashSet<String> = HashSet::new();
        let mut last_error: Option<Error> = None;

        for _ in 0..total_accounts {
            let Some(account) = self.manager.get_current_account(&skip).await else {
                let any_enabled = self.manager.snapshot().await.iter().any(|a| a.enabled);
                return Err(if any_enabled {
                    Error::AllSkipped
                } else {
                    Error::NoEnabledAccounts
                });
            };

            self.toast_first_use(&account, is_messages_post).await;

            let access_token = if account.access.is_empty() || account.expires <= crate::now_ms() {
                match self.refresh_single_flight(&account).await {
                    Ok(refreshed) => refreshed.access_token,
                    Err(failure) => {
                        self.manager.mark_failure(&account.id).await;
                        let is_terminal = matches!(failure.status, Some(400) | Some(401) | Some(403))
                            || matches!(
                                failure.error_code.as_deref(),
                                Some("invalid_grant") | Some("invalid_request")
                            );
                        if is_terminal {
                            let _ = self
                                .manager
                                .disable_permanently(&account.id, &failure.message)
                                .await;
                        } else {
                            skip.insert(account.id.clone());
                        }
                        last_error = Some(Error::RefreshFailed {
                            status: failure.status,
                            error_code: failure.error_code,
                            message: failure.message,
                        });
                        continue;
                    }
                }
            } else {
                account.access.clone()
            };

            let mut attempt_headers = request.headers.clone();
            apply_auth_header(&mut attempt_headers, &access_token);

            let mut builder = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(attempt_headers);
            if let Some(body) = &rewritten_body {
                builder = builder.body(body.clone());
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    self.manager.mark_failure(&account.id).await;
                    skip.insert(account.id.clone());
                    last_error = Some(Error::Upstream(e));
                    continue;
                }
            };

            let status = response.status().as_u16();
            let response_headers = response.headers().clone();
            let retry_after = response_headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| backoff::parse_retry_after(v, crate::now_ms()));
            let content_type = response_headers
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            if (200..300).contains(&status) {
                self.manager.mark_success(&account.id).await;
                if content_type.starts_with("text/event-stream") {
                    let stream = scan_sse_stream(
                        response.bytes_stream(),
                        Arc::clone(&self.manager),
                        account.id.clone(),
                    );
                    return Ok(InterceptedResponse {
                        status,
                        headers: response_headers,
                        body: Box::pin(stream),
                    });
                }
                let body_text = response.text().await.map_err(Error::Upstream)?;
                let bytes = Bytes::from(strip_mcp_name_prefix(&body_text));
                return Ok(InterceptedResponse {
                    status,
                    headers: response_headers,
                    body: Box::pin(stream::once(async move { Ok(bytes) })),
                });
            }

            let body_text = response.text().await.unwrap_or_default();
            let parsed_body: Option<Value> = serde_json::from_str(&body_text).ok();
            match backoff::classify(status, parsed_body.as_ref()) {
                Classification::ServiceWide => {
                    let bytes = Bytes::from(strip_mcp_name_prefix(&body_text));
                    return Ok(InterceptedResponse {
                        status,
                        headers: response_headers,
                        body: Box::pin(stream::once(async move { Ok(bytes) })),
                    });
                }
                Classification::AccountSpecific(reason) => {
                    if reason == FailureReason::AuthFailed {
                        self.manager.clear_access_token(&account.id).await;
                    }
                    let retry_after_for_reason = if reason == FailureReason::AuthFailed {
                        None
                    } else {
                        retry_after
                    };
                    self.manager
                        .mark_rate_limited(&account.id, reason, retry_after_for_reason)
                        .await;
                    self.toast_switch(&account, reason).await;
                    last_error = Some(Error::AccountFailure(reason, status));
                    continue;
                }
            }
        }

        Err(last_error.unwrap_or(Error::Exhausted))
    }

    async fn toast_first_use(&self, account: &Account, is_messages_post: bool) {
        if !is_messages_post {
            return;
        }
        {
            let mut seen = self.toasted_accounts.lock().await;
            if seen.contains(&account.id) {
                return;
            }
            seen.insert(account.id.clone());
        }

        let accounts = self.manager.snapshot().await;
        let enabled: Vec<&Account> = accounts.iter().filter(|a| a.enabled).collect();
        let total = enabled.len();
        let position = enabled.iter().position(|a| a.id == account.id).map(|p| p + 1);
        let label = account
            .email
            .clone()
            .unwrap_or_else(|| format!("Account {}", position.unwrap_or(1)));

        let message = if total <= 1 {
            format!("Claude: {label}")
        } else {
            format!("Claude: {label} ({}/{total})", position.unwrap_or(1))
        };
        self.manager.notifier().notify(ToastLevel::Info, None, &message);
    }

    async fn toast_switch(&self, account: &Account, reason: FailureReason) {
        let config = self.manager.config();
        if config.toasts.quiet {
            return;
        }
        let debounce = Duration::from_secs(config.toasts.debounce_seconds as u64);
        let mut last = self.last_switch_toast.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last
            && now.duration_since(previous) < debounce
        {
            return;
        }
        *last = Some(now);
        drop(last);

        let label = account.email.clone().unwrap_or_else(|| account.id.clone());
        self.manager.notifier().notify(
            ToastLevel::Warning,
            Some("account-switch"),
            &format!("{label} {}, switching account", reason.as_str()),
        );
    }

    async fn refresh_single_flight(&self, account: &Account) -> RefreshOutcome {
        let key = account.id.clone();
        let mut map = self.refresh_inflight.lock().await;
        if let Some(rx) = map.get(&key).cloned() {
            drop(map);
            return Self::await_refresh(rx).await;
        }

        let (tx, rx) = watch::channel(None);
        map.insert(key.clone(), rx.clone());
        drop(map);

        let outcome = self.do_refresh(account).await;
        let _ = tx.send(Some(outcome.clone()));

        let mut map = self.refresh_inflight.lock().await;
        if let Some(current) = map.get(&key)
            && current.same_channel(&rx)
        {
            map.remove(&key);
        }
        drop(map);

        outcome
    }

    async fn await_refresh(mut rx: watch::Receiver<Option<RefreshOutcome>>) -> RefreshOutcome {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(RefreshFailure {
                    status: None,
                    error_code: None,
                    message: "refresh coalescer dropped before completion".into(),
                });
            }
        }
    }

    async fn do_refresh(&self, account: &Account) -> RefreshOutcome {
        match anthropic_auth::refresh_token_detailed(&self.client, &account.refresh_token).await {
            Ok(response) => {
                let expires = crate::now_ms() + response.expires_in * 1000;
                let refreshed = RefreshedToken {
                    access_token: response.access_token.clone(),
                    expires,
                };
                if let Err(e) = self
                    .manager
                    .apply_refreshed_token(
                        &account.id,
                        response.access_token,
                        Some(response.refresh_token),
                        expires,
                    )
                    .await
                {
                    return Err(RefreshFailure {
                        status: None,
                        error_code: None,
                        message: e.to_string(),
                    });
                }
                Ok(refreshed)
            }
            Err(e) => Err(RefreshFailure {
                status: e.status,
                error_code: e.error_code,
                message: e.message,
            }),
        }
    }
}

fn apply_auth_header(headers: &mut HeaderMap, access_token: &str) {
    headers.remove(reqwest::header::AUTHORIZATION);
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {access_token}")) {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
}

/// §4.5 step 2 URL rewrite: tag `/v1/messages` with `beta=true`.
fn rewrite_url(url: &mut reqwest::Url) {
    if url.path() == "/v1/messages" {
        url.query_pairs_mut().append_pair("beta", "true");
    }
}

/// §4.5 step 2 header rewrite, minus the per-attempt authorization header
/// (applied separately per selected account): strip `x-api-key`, set
/// `user-agent`, merge `anthropic-beta`.
fn strip_and_merge_headers(headers: &mut HeaderMap) {
    headers.remove("x-api-key");
    headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    merge_beta_header(headers);
}

fn merge_beta_header(headers: &mut HeaderMap) {
    let mut flags: Vec<String> = REQUIRED_BETAS.iter().map(|s| s.to_string()).collect();
    if let Some(existing) = headers.get("anthropic-beta").and_then(|v| v.to_str().ok()) {
        for flag in existing.split(',') {
            let trimmed = flag.trim();
            if !trimmed.is_empty() && !flags.iter().any(|f| f == trimmed) {
                flags.push(trimmed.to_string());
            }
        }
    }
    if let Ok(value) = HeaderValue::from_str(&flags.join(",")) {
        headers.insert(HeaderName::from_static("anthropic-beta"), value);
    }
}

/// Best-effort JSON body transform (§4.5 step 2); unparseable bodies pass
/// through untouched.
fn rewrite_body(body: Option<&[u8]>) -> Option<Bytes> {
    let body = body?;
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return Some(Bytes::copy_from_slice(body));
    };
    rewrite_request_body(&mut value);
    match serde_json::to_vec(&value) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(_) => Some(Bytes::copy_from_slice(body)),
    }
}

fn rewrite_request_body(value: &mut Value) {
    if let Some(system) = value.get_mut("system").and_then(|v| v.as_array_mut()) {
        for block in system.iter_mut() {
            let is_text = block.get("type").and_then(|t| t.as_str()) == Some("text");
            if !is_text {
                continue;
            }
            if let Some(text) = block.get("text").and_then(|t| t.as_str()).map(str::to_string) {
                block["text"] = Value::String(rewrite_opencode_text(&text));
            }
        }
    }

    if let Some(tools) = value.get_mut("tools").and_then(|v| v.as_array_mut()) {
        for tool in tools.iter_mut() {
            prefix_mcp_name(tool);
        }
    }

    if let Some(messages) = value.get_mut("messages").and_then(|v| v.as_array_mut()) {
        for message in messages.iter_mut() {
            if let Some(content) = message.get_mut("content").and_then(|c| c.as_array_mut()) {
                for block in content.iter_mut() {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        prefix_mcp_name(block);
                    }
                }
            }
        }
    }
}

fn prefix_mcp_name(object: &mut Value) {
    if let Some(name) = object.get("name").and_then(|n| n.as_str()).map(str::to_string)
        && !name.starts_with("mcp_")
    {
        object["name"] = Value::String(format!("mcp_{name}"));
    }
}

/// Rewrite "OpenCode" (exact case) to "Claude Code", then rewrite any
/// remaining case-insensitive "opencode" occurrences to "Claude" except
/// where preceded by `/` (preserves filesystem paths).
fn rewrite_opencode_text(text: &str) -> String {
    let renamed = text.replace("OpenCode", "Claude Code");
    replace_case_insensitive_preserving_paths(&renamed, "opencode", "Claude")
}

fn replace_case_insensitive_preserving_paths(haystack: &str, needle: &str, replacement: &str) -> String {
    let needle_bytes = needle.as_bytes();
    let hay_bytes = haystack.as_bytes();
    let mut result = String::with_capacity(haystack.len());
    let mut i = 0;
    while i < hay_bytes.len() {
        if i + needle_bytes.len() <= hay_bytes.len()
            && hay_bytes[i..i + needle_bytes.len()].eq_ignore_ascii_case(needle_bytes)
        {
            let preceded_by_slash = i > 0 && hay_bytes[i - 1] == b'/';
            if !preceded_by_slash {
                result.push_str(replacement);
                i += needle_bytes.len();
                continue;
            }
        }
        let ch = haystack[i..].chars().next().expect("i is a char boundary");
        result.push(ch);
        i += ch.len_utf8();
    }
    result
}

/// Reverse the request-side `mcp_` prefixing on passthrough bytes:
/// `"name":"mcp_<x>"` → `"name":"<x>"`.
fn strip_mcp_name_prefix(text: &str) -> String {
    text.replace("\"name\":\"mcp_", "\"name\":\"")
}

struct SseScanState<S> {
    inner: S,
    buffer: String,
    stats: Stats,
    stats_nonzero: bool,
    error_latched: bool,
    finished_inner: bool,
    manager: Arc<AccountManager>,
    account_id: String,
}

/// Line-boundary SSE scan: buffers chunks (normalising CRLF to LF), splits
/// complete events on a blank line, extracts usage from `message_start`/
/// `message_delta`, detects an account-specific mid-stream `event: error`
/// (latched — fires [`AccountManager::mark_rate_limited`] at most once per
/// stream), and rewrites `mcp_`-prefixed tool names back out before
/// forwarding bytes downstream.
fn scan_sse_stream<S>(
    inner: S,
    manager: Arc<AccountManager>,
    account_id: String,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
    let state = SseScanState {
        inner,
        buffer: String::new(),
        stats: Stats::default(),
        stats_nonzero: false,
        error_latched: false,
        finished_inner: false,
        manager,
        account_id,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(boundary) = find_event_boundary(&state.buffer) {
                let event_text: String = state.buffer.drain(..boundary).collect();
                process_sse_event(&event_text, &mut state).await;
                let out = Bytes::from(strip_mcp_name_prefix(&event_text));
                return Some((Ok(out), state));
            }

            if state.finished_inner {
                if !state.buffer.is_empty() {
                    let remaining = std::mem::take(&mut state.buffer);
                    let out = Bytes::from(strip_mcp_name_prefix(&remaining));
                    return Some((Ok(out), state));
                }
                if state.stats_nonzero {
                    state.stats_nonzero = false;
                    let stats = state.stats;
                    state
                        .manager
                        .record_usage(
                            &state.account_id,
                            stats.input_tokens,
                            stats.output_tokens,
                            stats.cache_read_tokens,
                            stats.cache_write_tokens,
                        )
                        .await;
                }
                return None;
            }

            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    let chunk = String::from_utf8_lossy(&bytes);
                    state.buffer.push_str(&chunk.replace("\r\n", "\n"));
                }
                Some(Err(e)) => {
                    return Some((Err(std::io::Error::other(e.to_string())), state));
                }
                None => {
                    state.finished_inner = true;
                }
            }
        }
    })
}

/// Returns the end offset (inclusive of the separating blank line) of the
/// first complete SSE event in `buffer`, if any.
fn find_event_boundary(buffer: &str) -> Option<usize> {
    buffer.find("\n\n").map(|idx| idx + 2)
}

async fn process_sse_event<S>(event_text: &str, state: &mut SseScanState<S>) {
    let mut event_type: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in event_text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
    }
    if data_lines.is_empty() {
        return;
    }
    let data = data_lines.join("\n");
    let Ok(payload) = serde_json::from_str::<Value>(&data) else {
        return;
    };
    let payload_type = payload.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match payload_type {
        "message_start" => {
            if let Some(usage) = payload.pointer("/message/usage") {
                fill_zero_usage_fields(&mut state.stats, usage);
                state.stats_nonzero = state.stats_nonzero || !state.stats.is_zero();
            }
        }
        "message_delta" => {
            if let Some(usage) = payload.get("usage") {
                overwrite_usage_fields(&mut state.stats, usage);
                state.stats_nonzero = state.stats_nonzero || !state.stats.is_zero();
            }
        }
        _ => {}
    }

    let is_error_event = event_type == Some("error") || payload_type == "error";
    if is_error_event && !state.error_latched {
        let error_body = payload.get("error").cloned().unwrap_or_else(|| payload.clone());
        let wrapped = serde_json::json!({ "error": error_body });
        if let Classification::AccountSpecific(reason) = backoff::classify(400, Some(&wrapped)) {
            state.error_latched = true;
            if reason == FailureReason::AuthFailed {
                state.manager.clear_access_token(&state.account_id).await;
            }
            state
                .manager
                .mark_rate_limited(&state.account_id, reason, None)
                .await;
            debug!(account_id = %state.account_id, reason = reason.as_str(), "mid-stream account-specific error latched");
        }
    }
}

fn fill_zero_usage_fields(stats: &mut Stats, usage: &Value) {
    if stats.input_tokens == 0 {
        stats.input_tokens = usage_field(usage, "input_tokens");
    }
    if stats.output_tokens == 0 {
        stats.output_tokens = usage_field(usage, "output_tokens");
    }
    if stats.cache_read_tokens == 0 {
        stats.cache_read_tokens = usage_field(usage, "cache_read_input_tokens");
    }
    if stats.cache_write_tokens == 0 {
        stats.cache_write_tokens = usage_field(usage, "cache_creation_input_tokens");
    }
}

fn overwrite_usage_fields(stats: &mut Stats, usage: &Value) {
    if let Some(v) = usage.get("input_tokens") {
        stats.input_tokens = v.as_u64().unwrap_or(stats.input_tokens);
    }
    if let Some(v) = usage.get("output_tokens") {
        stats.output_tokens = v.as_u64().unwrap_or(stats.output_tokens);
    }
    if let Some(v) = usage.get("cache_read_input_tokens") {
        stats.cache_read_tokens = v.as_u64().unwrap_or(stats.cache_read_tokens);
    }
    if let Some(v) = usage.get("cache_creation_input_tokens") {
        stats.cache_write_tokens = v.as_u64().unwrap_or(stats.cache_write_tokens);
    }
}

fn usage_field(usage: &Value, field: &str) -> u64 {
    usage.get(field).and_then(|v| v.as_u64()).unwrap_or(0)
}
