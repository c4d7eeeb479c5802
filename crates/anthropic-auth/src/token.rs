//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (initial OAuth flow completion)
//! 2. Token refresh (proactive and request-time refresh)
//!
//! Both operations POST to `TOKEN_ENDPOINT` with different grant types.
//! The token endpoint is Anthropic's console (`console.anthropic.com`),
//! not the inference API (`api.anthropic.com`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{ANTHROPIC_CLIENT_ID, REDIRECT_URI, REVOKE_ENDPOINT, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// Timeout applied to the best-effort revoke call.
const REVOKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when storing
/// the credential.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    /// Present on a successful `authorization_code` exchange; absent on refresh.
    #[serde(default)]
    pub account: Option<AccountInfo>,
}

/// The `account` object optionally attached to an `authorization_code`
/// exchange response.
#[derive(Debug, Deserialize, Serialize)]
pub struct AccountInfo {
    pub email_address: Option<String>,
}

impl TokenResponse {
    pub fn email(&self) -> Option<String> {
        self.account.as_ref().and_then(|a| a.email_address.clone())
    }
}

/// Exchange an authorization code for tokens (initial OAuth flow).
///
/// This is the second step of the PKCE flow: the user has authorized
/// in their browser, and we received the authorization code. We send
/// the code along with the PKCE verifier to prove we initiated the flow.
pub async fn exchange_code(
    client: &reqwest::Client,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(TOKEN_ENDPOINT)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", ANTHROPIC_CLIENT_ID),
            ("redirect_uri", REDIRECT_URI),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}

/// Refresh an access token using a refresh token.
///
/// Called proactively by the background refresh task (before expiration)
/// and reactively at request time (when token is about to expire).
pub async fn refresh_token(client: &reqwest::Client, refresh: &str) -> Result<TokenResponse> {
    refresh_token_detailed(client, refresh).await.map_err(|e| {
        if matches!(e.status, Some(401) | Some(403)) {
            Error::InvalidCredentials(e.message)
        } else {
            Error::TokenExchange(e.message)
        }
    })
}

/// A token-refresh failure with the HTTP status and, if present, the
/// upstream `error` field — the pool's interceptor uses these to decide
/// between a transient skip and a permanent account disable.
#[derive(Debug, Clone)]
pub struct RefreshError {
    pub status: Option<u16>,
    pub error_code: Option<String>,
    pub message: String,
}

/// Like [`refresh_token`] but preserves the status code and `error` field
/// instead of collapsing them into a generic [`Error`] variant.
pub async fn refresh_token_detailed(
    client: &reqwest::Client,
    refresh: &str,
) -> std::result::Result<TokenResponse, RefreshError> {
    let response = client
        .post(TOKEN_ENDPOINT)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", ANTHROPIC_CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|e| RefreshError {
            status: None,
            error_code: None,
            message: format!("token refresh request failed: {e}"),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        let error_code = extract_error_field(&body);

        return Err(RefreshError {
            status: Some(status.as_u16()),
            error_code,
            message: format!("token refresh returned {status}: {body}"),
        });
    }

    response.json::<TokenResponse>().await.map_err(|e| RefreshError {
        status: Some(status.as_u16()),
        error_code: None,
        message: format!("invalid refresh response: {e}"),
    })
}

/// Best-effort extraction of an `error` (or `error.type`) field from a JSON
/// error body, used as the `errorCode` for refresh-failure classification.
fn extract_error_field(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    if let Some(s) = value.get("error").and_then(|e| e.as_str()) {
        return Some(s.to_string());
    }
    value
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Revoke a refresh token, best-effort.
///
/// Called on `logout`. Network and non-2xx failures are swallowed into
/// `Ok(false)` — per the external contract, a failed revocation must never
/// block the caller from forgetting the account locally. Bounded to
/// `REVOKE_TIMEOUT` so a hung revoke endpoint cannot hang `logout`.
pub async fn revoke(client: &reqwest::Client, refresh: &str) -> bool {
    let request = client
        .post(REVOKE_ENDPOINT)
        .json(&serde_json::json!({
            "token": refresh,
            "token_type_hint": "refresh_token",
            "client_id": ANTHROPIC_CLIENT_ID,
        }))
        .timeout(REVOKE_TIMEOUT)
        .send();

    match request.await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}
